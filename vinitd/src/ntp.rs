//! Time synchronization through the bundled chrony daemon.

use std::path::Path;

use vinitd_shared::{VinitdError, VinitdResult};

use crate::console::announce;

const CHRONYD_BIN: &str = "/vorteil/chronyd";
const CHRONYD_CFG_PATH: &str = "/etc/chrony.conf";

const CHRONYD_CFG_BASE: &str = "\ndriftfile /etc/chrony.drift\nmakestep 1.0 3\nrtcsync";

/// One `server <addr> iburst` line per configured server, prepended to
/// the fixed stanza.
pub fn chrony_config(ntps: &[String]) -> String {
    let mut cfg = CHRONYD_CFG_BASE.to_string();
    for server in ntps {
        cfg = format!("server {} iburst\n{}", server, cfg);
    }
    cfg
}

fn start_chrony() -> VinitdResult<()> {
    std::process::Command::new(CHRONYD_BIN)
        .spawn()
        .map_err(|e| VinitdError::Internal(format!("can not start chronyd: {}", e)))?;
    Ok(())
}

/// Start chrony with an existing config, or materialize one from the
/// configured NTP servers. No servers and no config file means no NTP.
pub fn setup_chronyd(ntps: &[String]) -> VinitdResult<()> {
    tracing::debug!("ntp servers found: {}", ntps.len());

    // a shipped chrony config wins
    if Path::new(CHRONYD_CFG_PATH).exists() {
        announce("chrony config file found");
        return start_chrony();
    }

    if ntps.is_empty() {
        return Ok(());
    }

    announce(&format!("ntp servers\t: {}", ntps.join(", ")));

    if let Some(parent) = Path::new(CHRONYD_CFG_PATH).parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let cfg = chrony_config(ntps);
    std::fs::write(CHRONYD_CFG_PATH, &cfg)?;
    tracing::debug!("ntp config:\n{}", cfg);

    start_chrony()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chrony_config_prepends_servers() {
        let cfg = chrony_config(&["10.0.0.1".into(), "pool.ntp.org".into()]);
        let lines: Vec<&str> = cfg.lines().collect();
        assert_eq!(lines[0], "server pool.ntp.org iburst");
        assert_eq!(lines[1], "server 10.0.0.1 iburst");
        assert!(cfg.contains("driftfile /etc/chrony.drift"));
        assert!(cfg.contains("makestep 1.0 3"));
        assert!(cfg.contains("rtcsync"));
    }

    #[test]
    fn test_chrony_config_empty() {
        let cfg = chrony_config(&[]);
        assert!(!cfg.contains("server"));
        assert!(cfg.contains("rtcsync"));
    }
}
