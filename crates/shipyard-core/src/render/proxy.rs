//! Reverse-proxy site definitions rendered as nginx configuration.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Routing for one environment: an upstream of the release's web ports plus
/// static and media aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Site name; also the config file stem (`<project>-<environment>`).
    pub site: String,
    pub upstream: String,
    pub server_name: String,
    pub ports: Vec<u16>,
    pub tls: Option<TlsFiles>,
    pub aliases: Vec<PathAlias>,
    /// Path proxied to the upstream's health endpoint, with access logging off.
    pub health_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFiles {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// Proxy site name of an environment.
pub fn site_name(project: &str, environment: &str) -> String {
    format!("{}-{}", project, environment)
}

impl TlsFiles {
    pub fn for_site(site: &str) -> Self {
        Self {
            certificate: PathBuf::from(format!("/etc/ssl/certs/{}.crt", site)),
            key: PathBuf::from(format!("/etc/ssl/private/{}.key", site)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathAlias {
    pub url: String,
    pub dir: PathBuf,
    pub expires: String,
    pub immutable: bool,
}

impl ProxyConfig {
    pub fn to_nginx(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# managed by shipyard, do not edit");
        let _ = writeln!(out, "upstream {} {{", self.upstream);
        for port in &self.ports {
            let _ = writeln!(
                out,
                "    server 127.0.0.1:{} max_fails=3 fail_timeout=30s;",
                port
            );
        }
        let _ = writeln!(out, "    keepalive 32;");
        let _ = writeln!(out, "}}");
        let _ = writeln!(out);

        match &self.tls {
            Some(tls) => {
                let _ = writeln!(out, "server {{");
                let _ = writeln!(out, "    listen 80;");
                let _ = writeln!(out, "    server_name {};", self.server_name);
                let _ = writeln!(out, "    return 301 https://$host$request_uri;");
                let _ = writeln!(out, "}}");
                let _ = writeln!(out);
                let _ = writeln!(out, "server {{");
                let _ = writeln!(out, "    listen 443 ssl http2;");
                let _ = writeln!(out, "    server_name {};", self.server_name);
                let _ = writeln!(out, "    ssl_certificate {};", tls.certificate.display());
                let _ = writeln!(out, "    ssl_certificate_key {};", tls.key.display());
                let _ = writeln!(out, "    ssl_protocols TLSv1.2 TLSv1.3;");
                let _ = writeln!(out, "    ssl_ciphers HIGH:!aNULL:!MD5;");
                let _ = writeln!(out, "    ssl_prefer_server_ciphers on;");
            }
            None => {
                let _ = writeln!(out, "server {{");
                let _ = writeln!(out, "    listen 80;");
                let _ = writeln!(out, "    server_name {};", self.server_name);
            }
        }
        let _ = writeln!(out, "    client_max_body_size 100M;");
        let _ = writeln!(out);
        let _ = writeln!(out, "    location / {{");
        let _ = writeln!(out, "        proxy_pass http://{};", self.upstream);
        let _ = writeln!(out, "        proxy_http_version 1.1;");
        let _ = writeln!(out, "        proxy_set_header Connection \"\";");
        let _ = writeln!(out, "        proxy_set_header Host $host;");
        let _ = writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;");
        let _ = writeln!(
            out,
            "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
        );
        let _ = writeln!(out, "        proxy_set_header X-Forwarded-Proto $scheme;");
        let _ = writeln!(out, "        proxy_connect_timeout 60s;");
        let _ = writeln!(out, "        proxy_send_timeout 60s;");
        let _ = writeln!(out, "        proxy_read_timeout 60s;");
        let _ = writeln!(out, "    }}");

        for alias in &self.aliases {
            let _ = writeln!(out);
            let _ = writeln!(out, "    location {} {{", alias.url);
            let _ = writeln!(out, "        alias {}/;", alias.dir.display());
            let _ = writeln!(out, "        expires {};", alias.expires);
            if alias.immutable {
                let _ = writeln!(out, "        add_header Cache-Control \"public, immutable\";");
            }
            let _ = writeln!(out, "    }}");
        }

        if let Some(path) = &self.health_path {
            let _ = writeln!(out);
            let _ = writeln!(out, "    location = {} {{", path);
            let _ = writeln!(out, "        proxy_pass http://{}{};", self.upstream, path);
            let _ = writeln!(out, "        access_log off;");
            let _ = writeln!(out, "    }}");
        }
        let _ = writeln!(out, "}}");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tls: bool) -> ProxyConfig {
        ProxyConfig {
            site: "checkout-qa".into(),
            upstream: "checkout_qa".into(),
            server_name: "_".into(),
            ports: vec![8100, 8101],
            tls: tls.then(|| TlsFiles::for_site("checkout-qa")),
            aliases: vec![PathAlias {
                url: "/static/".into(),
                dir: PathBuf::from("/srv/apps/checkout/releases/qa/r1/staticfiles"),
                expires: "30d".into(),
                immutable: true,
            }],
            health_path: Some("/health/".into()),
        }
    }

    #[test]
    fn plain_site_routes_to_release_ports() {
        let text = config(false).to_nginx();
        assert!(text.contains("server 127.0.0.1:8100 max_fails=3"));
        assert!(text.contains("server 127.0.0.1:8101 max_fails=3"));
        assert!(text.contains("alias /srv/apps/checkout/releases/qa/r1/staticfiles/;"));
        assert!(text.contains("location = /health/ {"));
        assert!(!text.contains("443"));
    }

    #[test]
    fn tls_site_redirects_plain_http() {
        let text = config(true).to_nginx();
        assert!(text.contains("return 301 https://$host$request_uri;"));
        assert!(text.contains("ssl_certificate /etc/ssl/certs/checkout-qa.crt;"));
        assert!(text.contains("ssl_certificate_key /etc/ssl/private/checkout-qa.key;"));
    }
}
