use serde::{Deserialize, Serialize};

/// TLS termination for the public listener
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SslConfig {
    pub enabled: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub auto_cert: bool,
    pub hosts: Vec<String>,
}

impl SslConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.auto_cert {
            return Err(anyhow::anyhow!(
                "ssl.auto_cert is not supported, provide cert_file and key_file"
            ));
        }
        let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        if !has(&self.cert_file) || !has(&self.key_file) {
            return Err(anyhow::anyhow!(
                "SSL enabled but cert_file or key_file not specified"
            ));
        }
        Ok(())
    }
}
