//! Process-wide settings, built once at start-up.

use crate::{Error, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Well-known values of an LRP node. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Group all nodes listen to for multicast protocol messages.
    pub multicast_group: Ipv4Addr,
    /// UDP port of the protocol, unicast and multicast.
    pub service_port: u16,
    /// nftables table holding the chains below.
    pub nft_table: String,
    /// Host chain hooked on forward.
    pub forward_chain: String,
    /// Dedicated loop-avoidance chain.
    pub chain_name: String,
    /// NFQUEUE number non-routable packets are diverted to.
    pub queue_num: u16,
    /// Route-owner protocol number tagging our kernel routes.
    pub route_protocol: u8,
    pub report_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            multicast_group: Ipv4Addr::new(224, 0, 0, 120),
            service_port: 6666,
            nft_table: "filter".to_string(),
            forward_chain: "FORWARD".to_string(),
            chain_name: "LRP".to_string(),
            queue_num: 43,
            route_protocol: 43,
            report_interval_secs: 30,
        }
    }
}

impl Settings {
    /// Read settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if !self.multicast_group.is_multicast() {
            return Err(Error::Config(format!(
                "{} is not a multicast address",
                self.multicast_group
            )));
        }
        if self.report_interval_secs == 0 {
            return Err(Error::Config("report_interval_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.multicast_group, Ipv4Addr::new(224, 0, 0, 120));
        assert_eq!(settings.service_port, 6666);
        assert_eq!(settings.queue_num, 43);
        assert_eq!(settings.route_protocol, 43);
        assert_eq!(settings.report_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_partial_file() {
        let file = write_config(r#"{"service_port": 7777, "chain_name": "LRP_TEST"}"#);
        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.service_port, 7777);
        assert_eq!(settings.chain_name, "LRP_TEST");
        assert_eq!(settings.nft_table, "filter");
    }

    #[test]
    fn test_load_rejects_bad_values() {
        let file = write_config(r#"{"multicast_group": "10.0.0.1"}"#);
        assert!(matches!(Settings::load(file.path()), Err(Error::Config(_))));

        let file = write_config(r#"{"report_interval_secs": 0}"#);
        assert!(matches!(Settings::load(file.path()), Err(Error::Config(_))));

        let file = write_config(r#"{"no_such_key": 1}"#);
        assert!(matches!(Settings::load(file.path()), Err(Error::Config(_))));

        assert!(matches!(
            Settings::load(Path::new("/nonexistent/lrpd.json")),
            Err(Error::Io(_))
        ));
    }
}
