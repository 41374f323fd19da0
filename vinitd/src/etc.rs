//! /etc synthesis from embedded templates.
//!
//! Template files are only written when the destination is missing, so an
//! image that ships its own /etc wins. On a read-only root the whole pass
//! is skipped.

use std::fmt::Write as _;
use std::path::Path;

use vinitd_shared::VinitdResult;

const PASSWD_TEMPLATE: &str = "root:x:0:0:root:/:/bin/false\n";
const GROUP_TEMPLATE: &str = "root:x:0:root\n";

const NSSWITCH_TEMPLATE: &str = "\
passwd:     files
group:      files
shadow:     files
hosts:      files dns
networks:   files
protocols:  files
services:   files
";

const RESOLV_TEMPLATE: &str = "\
nameserver 127.0.0.1
options ndots:0
";

const PARSERS_TEMPLATE: &str = "\
[PARSER]
    Name        syslog
    Format      regex
    Regex       ^\\<(?<pri>[0-9]+)\\>(?<time>[^ ]* {1,2}[^ ]* [^ ]*) (?<host>[^ ]*) (?<ident>[a-zA-Z0-9_\\/\\.\\-]*)(?:\\[(?<pid>[0-9]+)\\])?(?:[^\\:]*\\:)? *(?<message>.*)$
    Time_Key    time
    Time_Format %b %d %H:%M:%S
[PARSER]
    Name        json
    Format      json
    Time_Key    time
    Time_Format %d/%b/%Y:%H:%M:%S %z
";

const DEFAULT_USER: &str = "vorteil";

/// Minimal TZif for UTC, written as /etc/localtime.
fn tzif_utc() -> Vec<u8> {
    let mut b = Vec::with_capacity(54);
    b.extend_from_slice(b"TZif");
    b.push(0); // version 1
    b.extend_from_slice(&[0u8; 15]);
    // isutcnt, isstdcnt, leapcnt, timecnt, typecnt, charcnt
    for count in [0u32, 0, 0, 0, 1, 4] {
        b.extend_from_slice(&count.to_be_bytes());
    }
    // single ttinfo: offset 0, no dst, designation index 0
    b.extend_from_slice(&0i32.to_be_bytes());
    b.push(0);
    b.push(0);
    b.extend_from_slice(b"UTC\0");
    b
}

fn template(name: &str) -> Option<Vec<u8>> {
    match name {
        "group" => Some(GROUP_TEMPLATE.into()),
        "passwd" => Some(PASSWD_TEMPLATE.into()),
        "nsswitch.conf" => Some(NSSWITCH_TEMPLATE.into()),
        "resolv.conf" => Some(RESOLV_TEMPLATE.into()),
        "parsers.conf" => Some(PARSERS_TEMPLATE.into()),
        "localtime" => Some(tzif_utc()),
        _ => None,
    }
}

const ETC_FILES: &[&str] = &[
    "group",
    "localtime",
    "nsswitch.conf",
    "passwd",
    "resolv.conf",
    "parsers.conf",
];

/// Write one embedded template to its destination.
pub fn write_etc_file(base_name: &str, full_name: &Path) -> VinitdResult<()> {
    if let Some(contents) = template(base_name) {
        std::fs::write(full_name, contents)?;
    }
    Ok(())
}

fn generate_etc_hosts(base: &Path, hostname: &str) {
    let path = base.join("hosts");
    if path.exists() {
        return;
    }
    tracing::debug!("file {:?} does not exist, creating", path);

    let mut s = String::new();
    let _ = writeln!(s, "127.0.0.1\tlocalhost");
    let _ = writeln!(s, "127.0.0.1\t{}", hostname);
    let _ = writeln!(s, "::1\tip6-localhost ip6-loopback");
    let _ = writeln!(s, "fe00::0\tip6-localnet");
    let _ = writeln!(s, "ff00::0\tip6-mcastprefix");
    let _ = writeln!(s, "ff02::1\tip6-allnodes");
    let _ = writeln!(s, "ff02::2\tip6-allrouters");

    if let Err(e) = std::fs::write(&path, s) {
        tracing::error!("can not create {:?}: {}", path, e);
    }
}

fn generate_machine_id(base: &Path) {
    let path = base.join("machine-id");
    if path.exists() {
        return;
    }
    let id = uuid::Uuid::new_v4();
    if let Err(e) = std::fs::write(&path, id.to_string()) {
        tracing::error!("can not create machine-id: {}", e);
    }
}

/// Ensure a root row and a uid/gid 1000 row for the configured user exist
/// in passwd and group, creating the files when missing.
pub fn add_user_group(base: &Path, user: &str) {
    let user = if user.is_empty() { DEFAULT_USER } else { user };

    let entries = [
        (
            base.join("passwd"),
            format!(
                "root:x:0:0:root:/:/bin/false\n{}:x:1000:1000:{}:/:/bin/false",
                user, user
            ),
        ),
        (
            base.join("group"),
            format!("root:x:0:root\n{}:x:1000:{}", user, user),
        ),
    ];

    for (path, row) in entries {
        tracing::debug!("checking {:?}", path);
        match std::fs::read_to_string(&path) {
            Ok(existing) => {
                if !existing.contains(&format!("{}:x:1000", user)) {
                    let appended = format!("{}{}\n", existing, row);
                    if let Err(e) = std::fs::write(&path, appended) {
                        tracing::error!("can not update {:?}: {}", path, e);
                    }
                }
            }
            Err(_) => {
                if let Err(e) = std::fs::write(&path, format!("{}\n", row)) {
                    tracing::error!("can not create {:?}: {}", path, e);
                }
            }
        }
    }
}

/// Populate `base` (normally /etc) with templates, hostname, hosts and
/// machine-id.
pub fn etc_generate_files(base: &Path, hostname: &str, user: &str) -> VinitdResult<()> {
    std::fs::create_dir_all(base)?;

    add_user_group(base, user);

    for f in ETC_FILES {
        let full = base.join(f);
        if !full.exists() {
            tracing::debug!("creating file {:?}", full);
            write_etc_file(f, &full)?;
        }
    }

    std::fs::write(base.join("hostname"), hostname)?;

    generate_etc_hosts(base, hostname);
    generate_machine_id(base);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_all_files() {
        let dir = tempfile::tempdir().unwrap();
        etc_generate_files(dir.path(), "vorteil", "vorteil").unwrap();

        let mut expected: Vec<&str> = ETC_FILES.to_vec();
        expected.extend(["hostname", "hosts", "machine-id"]);
        for f in &expected {
            assert!(dir.path().join(f).exists(), "missing {}", f);
        }

        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, expected.len());

        let h = std::fs::read_to_string(dir.path().join("hostname")).unwrap();
        assert_eq!(h, "vorteil");

        let hosts = std::fs::read_to_string(dir.path().join("hosts")).unwrap();
        assert!(hosts.contains("127.0.0.1\tvorteil"));
        assert!(hosts.contains("::1\tip6-localhost"));
    }

    #[test]
    fn test_user_rows_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        etc_generate_files(dir.path(), "host", "").unwrap();

        let passwd = std::fs::read_to_string(dir.path().join("passwd")).unwrap();
        let group = std::fs::read_to_string(dir.path().join("group")).unwrap();
        assert!(passwd.contains("vorteil:x:1000:1000"));

        // same user again changes nothing
        add_user_group(dir.path(), "");
        assert_eq!(
            passwd,
            std::fs::read_to_string(dir.path().join("passwd")).unwrap()
        );
        assert_eq!(
            group,
            std::fs::read_to_string(dir.path().join("group")).unwrap()
        );

        // a different user appends a row
        add_user_group(dir.path(), "random");
        let updated = std::fs::read_to_string(dir.path().join("passwd")).unwrap();
        assert_ne!(passwd, updated);
        assert!(updated.contains("random:x:1000:1000"));
    }

    #[test]
    fn test_machine_id_is_stable_uuid() {
        let dir = tempfile::tempdir().unwrap();
        etc_generate_files(dir.path(), "h", "u").unwrap();

        let id = std::fs::read_to_string(dir.path().join("machine-id")).unwrap();
        uuid::Uuid::parse_str(id.trim()).unwrap();

        // untouched on a second run
        etc_generate_files(dir.path(), "h", "u").unwrap();
        let id2 = std::fs::read_to_string(dir.path().join("machine-id")).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn test_existing_files_win() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("resolv.conf"), "nameserver 10.0.0.1\n").unwrap();
        etc_generate_files(dir.path(), "h", "u").unwrap();
        let resolv = std::fs::read_to_string(dir.path().join("resolv.conf")).unwrap();
        assert_eq!(resolv, "nameserver 10.0.0.1\n");
    }

    #[test]
    fn test_localtime_is_tzif() {
        let data = tzif_utc();
        assert_eq!(&data[..4], b"TZif");
        assert!(data.ends_with(b"UTC\0"));
    }
}
