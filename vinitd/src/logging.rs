//! Guest log shipping.
//!
//! Builds a fluent-bit configuration from the image's `logging` entries
//! and spawns the bundled binary. Inputs depend on the entry type
//! (system metrics, kernel buffer, redirected stdout, program log files);
//! outputs copy the entry's key=value pairs with `$VAR` expansion against
//! the runtime environment.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::os::unix::fs::chown;
use std::path::Path;
use std::sync::Arc;

use crate::etc::write_etc_file;
use crate::instance::{Cloud, Vinitd, DEFAULT_TTY, ENV_INSTANCE_ID, USER_ID};
use crate::mounts::mount_fs;
use crate::vcfg::LoggingCfg;

const FLUENTBIT_BIN: &str = "/vorteil/fluent-bit";
const FLUENTBIT_PLUGIN: &str = "/vorteil/flb-in_vdisk.so";
const FLUENTBIT_CFG: &str = "/etc/fb.cfg";

const VLOG_DIR: &str = "/vlogs";
const VLOG_TYPE: &str = "vlogfs";

const LOG_SYSTEM: &str = "system";
const LOG_KERNEL: &str = "kernel";
const LOG_STDOUT: &str = "stdout";
const LOG_PROGRAMS: &str = "programs";

const INPUT: &str = "[INPUT]\n";

struct ConfigBuilder {
    out: String,
    inputs: HashSet<String>,
}

impl ConfigBuilder {
    fn new() -> ConfigBuilder {
        let mut out = String::new();
        out.push_str("[SERVICE]\n");
        out.push_str("    Flush 10\n");
        out.push_str("    Daemon off\n");
        out.push_str("    Log_Level error\n");
        out.push_str("    Parsers_File  /etc/parsers.conf\n");
        ConfigBuilder {
            out,
            inputs: HashSet::new(),
        }
    }

    fn once(&mut self, name: &str) -> bool {
        self.inputs.insert(name.to_string())
    }

    fn add_output(&mut self, entry: &LoggingCfg, match_tag: &str, envs: &HashMap<String, String>) {
        self.out.push_str("[OUTPUT]\n");

        for line in &entry.config {
            let Some((key, value)) = line.split_once('=') else {
                tracing::error!("can not add logging output for {}", line);
                continue;
            };

            let mut value = value.to_string();
            if let Some(name) = value.strip_prefix('$') {
                if let Some(e) = envs.get(name) {
                    tracing::debug!("replacing ${} for {}", name, e);
                    value = e.clone();
                }
            }

            let _ = writeln!(self.out, "    {} {}", key, value);
        }

        let _ = writeln!(self.out, "    Match_Regex {}", match_tag);
    }

    fn add_system(&mut self, ifc_names: &[String]) {
        for name in ["cpu", "disk", "mem", "vdisk"] {
            if !self.once(name) {
                continue;
            }
            self.out.push_str(INPUT);
            let _ = writeln!(self.out, "    Name {}", name);
            let _ = writeln!(self.out, "    Tag vsystem-{}", name);
        }

        for name in ifc_names {
            self.out.push_str(INPUT);
            self.out.push_str("    Name netif\n");
            let _ = writeln!(self.out, "    Interface {}", name);
            let _ = writeln!(self.out, "    Tag vsystem-{}", name);
        }
    }

    fn add_kernel(&mut self) {
        if !self.once("kmsg") {
            return;
        }
        self.out.push_str(INPUT);
        self.out.push_str("    Name kmsg\n");
        self.out.push_str("    Tag vkernel\n");
    }

    fn add_stdout(&mut self) {
        if !self.once("tail") {
            return;
        }
        self.out.push_str(INPUT);
        self.out.push_str("    Name tail\n");
        self.out.push_str("    Refresh_Interval 10\n");
        let _ = writeln!(self.out, "    Path {}/stdout", VLOG_DIR);
        self.out.push_str("    Path_Key filename\n");
        self.out.push_str("    Skip_Long_Lines On\n");
        self.out.push_str("    Tag vstdout\n");
    }

    fn add_program_logs(&mut self, log_files: &[String]) {
        for path in log_files {
            self.out.push_str(INPUT);
            self.out.push_str("    Name tail\n");
            let _ = writeln!(self.out, "    Path {}", path);
            self.out.push_str("    Path_Key filename\n");
            self.out.push_str("    Skip_Long_Lines On\n");
            self.out.push_str("    Tag vprog\n");
        }
    }

    fn add_filters(&mut self, envs: &HashMap<String, String>, cloud: Cloud) {
        self.out.push_str("[FILTER]\n");
        self.out.push_str("    Name record_modifier\n");
        self.out.push_str("    Match *\n");
        self.out.push_str("    Record hostname ${HOSTNAME}\n");

        if cloud == Cloud::Ec2 {
            if let Some(iid) = envs.get(ENV_INSTANCE_ID) {
                self.out.push_str("[FILTER]\n");
                self.out.push_str("    Name record_modifier\n");
                self.out.push_str("    Match *\n");
                let _ = writeln!(self.out, "    Record  ec2_instance_id {}", iid);
            }
        }
    }
}

fn mount_vlogs() {
    let _ = std::fs::create_dir_all(VLOG_DIR);
    if let Err(e) = mount_fs(VLOG_DIR, VLOG_TYPE, "") {
        tracing::debug!("can not mount {}: {}", VLOG_DIR, e);
    }
}

/// Route a copy of the vtty stream into /vlogs/stdout so the tail input
/// picks it up.
fn enable_stdout_redirect(v: &Arc<Vinitd>) {
    mount_vlogs();
    let path = format!("{}/stdout", VLOG_DIR);
    let _ = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .append(true)
        .open(&path);

    match std::fs::OpenOptions::new().read(true).write(true).open(&path) {
        Ok(f) => v.console.set_redir(f),
        Err(e) => tracing::error!("can not enable tty redirect: {}", e),
    }
}

/// Create and mount the per-program log directories.
fn prepare_program_logs(log_files: &[String]) {
    mount_vlogs();

    for path in log_files {
        let Some(dir) = Path::new(path).parent() else {
            continue;
        };
        tracing::debug!("creating logging dir {:?}", dir);
        let _ = std::fs::create_dir_all(dir);

        let occupied = std::fs::read_dir(dir)
            .map(|entries| entries.count() > 0)
            .unwrap_or(true);

        if occupied {
            tracing::warn!("logging directory not empty, using real directory");
        } else {
            tracing::debug!("mounting {:?} as log dir", dir);
            if let Err(e) = mount_fs(&dir.to_string_lossy(), VLOG_TYPE, "") {
                tracing::debug!("can not mount log dir: {}", e);
            }
        }

        let _ = chown(dir, Some(USER_ID), Some(USER_ID));
    }
}

/// Build the fluent-bit configuration for the configured entries.
pub fn build_config(
    logging: &[LoggingCfg],
    ifc_names: &[String],
    program_log_files: &[String],
    envs: &HashMap<String, String>,
    cloud: Cloud,
) -> (String, bool) {
    let mut b = ConfigBuilder::new();
    let mut needs_redirect = false;

    for entry in logging {
        tracing::debug!("logging type: {}", entry.log_type);

        match entry.log_type.as_str() {
            LOG_SYSTEM => {
                b.add_system(ifc_names);
                b.add_output(entry, "vsystem-*", envs);
            }
            LOG_KERNEL => {
                b.add_kernel();
                b.add_output(entry, "vkernel", envs);
            }
            LOG_STDOUT => {
                b.add_stdout();
                b.add_output(entry, "vstdout", envs);
                needs_redirect = true;
            }
            LOG_PROGRAMS => {
                b.add_program_logs(program_log_files);
                b.add_output(entry, "vprog", envs);
            }
            other => {
                b.add_system(ifc_names);
                b.add_kernel();
                b.add_stdout();
                b.add_program_logs(program_log_files);
                b.add_output(entry, other, envs);
                needs_redirect = true;
            }
        }
    }

    b.add_filters(envs, cloud);
    (b.out, needs_redirect)
}

/// Materialize the config and start the log shipper.
pub fn start_logging(v: &Arc<Vinitd>) {
    let _ = write_etc_file("parsers.conf", Path::new("/etc/parsers.conf"));

    let logging = v.vcfg.read().logging.clone();
    let ifc_names: Vec<String> = v.ifcs.lock().iter().map(|i| i.name.clone()).collect();
    let log_files: Vec<String> = v
        .programs
        .read()
        .iter()
        .flat_map(|p| p.cfg.log_files.clone())
        .collect();
    let envs = v.envs_snapshot();
    let cloud = v.hypervisor_info.lock().cloud;

    let has_stdout_or_all = logging
        .iter()
        .any(|l| !matches!(l.log_type.as_str(), LOG_SYSTEM | LOG_KERNEL | LOG_PROGRAMS));
    let has_programs = logging
        .iter()
        .any(|l| !matches!(l.log_type.as_str(), LOG_SYSTEM | LOG_KERNEL | LOG_STDOUT));

    if has_stdout_or_all {
        mount_vlogs();
    }
    if has_programs {
        prepare_program_logs(&log_files);
    }

    let (config, needs_redirect) = build_config(&logging, &ifc_names, &log_files, &envs, cloud);

    if needs_redirect {
        enable_stdout_redirect(v);
    }

    if let Err(e) = std::fs::write(FLUENTBIT_CFG, &config) {
        tracing::error!("can not create fluent-bit config file: {}", e);
        return;
    }
    tracing::debug!("logging conf: {}", config);

    let open_tty = || {
        std::fs::OpenOptions::new()
            .write(true)
            .append(true)
            .open(DEFAULT_TTY)
    };

    let (stdout, stderr) = match (open_tty(), open_tty()) {
        (Ok(o), Ok(e)) => (o, e),
        _ => {
            tracing::error!("can not open fluent-bit output");
            return;
        }
    };

    let hostname = v.hostname.read().clone();
    let result = std::process::Command::new(FLUENTBIT_BIN)
        .arg(format!("--config={}", FLUENTBIT_CFG))
        .arg("--quiet")
        .arg(format!("--plugin={}", FLUENTBIT_PLUGIN))
        .env_clear()
        .env("HOSTNAME", hostname)
        .env("HOME", "/")
        .env("LD_LIBRARY_PATH", "/vorteil")
        .stdout(stdout)
        .stderr(stderr)
        .spawn();

    if let Err(e) = result {
        tracing::error!("can not start fluent-bit: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(log_type: &str, config: &[&str]) -> LoggingCfg {
        LoggingCfg {
            log_type: log_type.to_string(),
            config: config.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_system_config_inputs() {
        let logging = [entry("system", &["Name=stdout"])];
        let (cfg, redirect) = build_config(
            &logging,
            &["eth0".into()],
            &[],
            &HashMap::new(),
            Cloud::None,
        );

        assert!(cfg.starts_with("[SERVICE]"));
        for input in ["Name cpu", "Name disk", "Name mem", "Name vdisk", "Name netif"] {
            assert!(cfg.contains(input), "missing {}", input);
        }
        assert!(cfg.contains("Interface eth0"));
        assert!(cfg.contains("Match_Regex vsystem-*"));
        assert!(cfg.contains("Record hostname ${HOSTNAME}"));
        assert!(!redirect);
    }

    #[test]
    fn test_env_substitution_in_output() {
        let mut envs = HashMap::new();
        envs.insert("EXT_IP0".to_string(), "203.0.113.9".to_string());

        let logging = [entry("kernel", &["Name=forward", "Host=$EXT_IP0"])];
        let (cfg, _) = build_config(&logging, &[], &[], &envs, Cloud::None);

        assert!(cfg.contains("Host 203.0.113.9"));
        assert!(cfg.contains("Name kmsg"));
        assert!(cfg.contains("Match_Regex vkernel"));
    }

    #[test]
    fn test_duplicate_inputs_collapse() {
        let logging = [
            entry("kernel", &["Name=stdout"]),
            entry("kernel", &["Name=forward"]),
        ];
        let (cfg, _) = build_config(&logging, &[], &[], &HashMap::new(), Cloud::None);
        assert_eq!(cfg.matches("Name kmsg").count(), 1);
        // both outputs survive
        assert_eq!(cfg.matches("[OUTPUT]").count(), 2);
    }

    #[test]
    fn test_stdout_requests_redirect() {
        let logging = [entry("stdout", &["Name=stdout"])];
        let (cfg, redirect) = build_config(&logging, &[], &[], &HashMap::new(), Cloud::None);
        assert!(redirect);
        assert!(cfg.contains("Path /vlogs/stdout"));
    }

    #[test]
    fn test_ec2_instance_filter() {
        let mut envs = HashMap::new();
        envs.insert(ENV_INSTANCE_ID.to_string(), "i-12345".to_string());
        let logging = [entry("kernel", &["Name=stdout"])];
        let (cfg, _) = build_config(&logging, &[], &[], &envs, Cloud::Ec2);
        assert!(cfg.contains("ec2_instance_id i-12345"));
    }
}
