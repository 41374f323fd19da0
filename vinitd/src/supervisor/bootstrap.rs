//! Per-program bootstrap preconditions.
//!
//! Each instruction is a single whitespace-split command evaluated in the
//! parent before exec. Unknown commands are rejected when the program is
//! prepped, not when it runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use vinitd_shared::{VinitdError, VinitdResult};

use crate::instance::Vinitd;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapStep {
    Sleep(u64),
    WaitFile(PathBuf),
    WaitPort { iface: String, ports: Vec<u16> },
    Get { url: String, dest: PathBuf },
    FindAndReplace { file: String, find: String, replace: String },
    DefineIfNotDefined { key: String, value: String },
}

/// Parse one bootstrap line.
pub fn parse(line: &str) -> VinitdResult<BootstrapStep> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((&cmd, args)) = parts.split_first() else {
        return Err(VinitdError::Launch("empty bootstrap instruction".into()));
    };

    let bad = |msg: &str| VinitdError::Launch(format!("bootstrap '{}': {}", cmd, msg));

    match cmd {
        "SLEEP" => {
            let [ms] = args else {
                return Err(bad("needs one value"));
            };
            let ms = ms.parse().map_err(|_| bad("can not parse sleep value"))?;
            Ok(BootstrapStep::Sleep(ms))
        }
        "WAIT_FILE" => {
            let [path] = args else {
                return Err(bad("needs one value"));
            };
            Ok(BootstrapStep::WaitFile(PathBuf::from(path)))
        }
        "WAIT_PORT" => {
            let (iface, ports) = match args.split_first() {
                Some((first, rest)) if first.starts_with("if=") => {
                    (first.trim_start_matches("if=").to_string(), rest)
                }
                _ => ("eth0".to_string(), args),
            };
            if ports.is_empty() {
                return Err(bad("needs at least one port"));
            }
            let ports = ports
                .iter()
                .map(|p| p.parse::<u16>().map_err(|_| bad(&format!("'{}' does not seem to be a port number", p))))
                .collect::<VinitdResult<Vec<u16>>>()?;
            Ok(BootstrapStep::WaitPort { iface, ports })
        }
        "GET" => {
            let [url, dest] = args else {
                return Err(bad("needs one url and one target file"));
            };
            Ok(BootstrapStep::Get {
                url: url.to_string(),
                dest: PathBuf::from(dest),
            })
        }
        "FIND_AND_REPLACE" => {
            let mut kv = HashMap::new();
            for a in args {
                let Some((k, v)) = a.split_once('=') else {
                    return Err(bad("arguments must be key=value"));
                };
                kv.insert(k, v.to_string());
            }
            match (kv.remove("file"), kv.remove("find"), kv.remove("replace")) {
                (Some(file), Some(find), Some(replace)) => Ok(BootstrapStep::FindAndReplace {
                    file,
                    find,
                    replace,
                }),
                _ => Err(bad("needs file=, find= and replace=")),
            }
        }
        "DEFINE_IF_NOT_DEFINED" => {
            let [key, value] = args else {
                return Err(bad("needs two values"));
            };
            Ok(BootstrapStep::DefineIfNotDefined {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
        other => Err(VinitdError::Launch(format!(
            "unknown bootstrap command: {}",
            other
        ))),
    }
}

/// Replace `$KEY` tokens against a list of `KEY=VALUE` pairs.
pub fn expand_from_env(mut s: String, env: &[String]) -> String {
    for pair in env {
        if let Some((k, v)) = pair.split_once('=') {
            s = s.replace(&format!("${}", k), v);
        }
    }
    s
}

/// Replace `$KEY` tokens against a map.
pub fn expand_from_map(mut s: String, envs: &HashMap<String, String>) -> String {
    for (k, v) in envs {
        s = s.replace(&format!("${}", k), v);
    }
    s
}

async fn wait_for_file(path: &PathBuf) {
    let mut count = 0u64;
    loop {
        if path.exists() {
            break;
        }
        if count % 30 == 0 && count > 0 {
            tracing::warn!("bootstrap 'WAIT_FILE' file {:?} has not appeared yet", path);
        }
        count += 1;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn wait_for_port(v: &Arc<Vinitd>, iface: &str, ports: &[u16]) {
    let addr = {
        let ifcs = v.ifcs.lock();
        ifcs.iter().find(|i| i.name == iface).and_then(|i| i.addr)
    };
    let Some(addr) = addr else {
        tracing::error!("bootstrap 'WAIT_PORT' unable to fetch interface {}", iface);
        return;
    };

    let tasks = ports.iter().map(|&port| async move {
        let target = std::net::SocketAddr::from((addr, port));
        let mut count = 0u64;
        loop {
            if tokio::net::TcpStream::connect(target).await.is_ok() {
                break;
            }
            if count % 30 == 0 {
                tracing::warn!(
                    "bootstrap 'WAIT_PORT' tcp connection to '{}:{}' has not come online",
                    addr,
                    port
                );
            }
            count += 1;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });

    futures::future::join_all(tasks).await;
}

/// HTTP GET to a local file; failures only log.
async fn get_request(url: &str, dest: &PathBuf) {
    tracing::debug!("get request: {}", url);

    let response = match reqwest::get(url).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("can not get url: {}", e);
            return;
        }
    };

    let body = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("can not read url body: {}", e);
            return;
        }
    };

    if let Some(dir) = dest.parent() {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::error!("can not create dir {:?}: {}", dir, e);
            return;
        }
    }

    if let Err(e) = std::fs::write(dest, &body) {
        tracing::error!("can not create file {:?}: {}", dest, e);
        return;
    }

    tracing::debug!("got {} to {:?}", url, dest);
}

/// Literal substring replacement inside a file, with `$VAR` expansion of
/// the replacement against the program environment.
pub fn find_and_replace(file: &str, find: &str, replace: &str, env: &[String]) {
    let Ok(text) = std::fs::read_to_string(file) else {
        tracing::warn!("file {} does not exist to replace text", file);
        return;
    };

    let replace = expand_from_env(replace.to_string(), env);
    let content = text.replace(find, &replace);

    if let Err(e) = std::fs::write(file, content) {
        tracing::error!("can not write {}: {}", file, e);
    }
}

/// Run the parsed bootstrap steps in declaration order. `env` and `args`
/// belong to the program being launched; DEFINE_IF_NOT_DEFINED may extend
/// the environment and re-substitute the arguments.
pub async fn run(
    v: &Arc<Vinitd>,
    steps: &[BootstrapStep],
    env: &mut Vec<String>,
    args: &mut Vec<String>,
) {
    for step in steps {
        match step {
            BootstrapStep::Sleep(ms) => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            BootstrapStep::WaitFile(path) => wait_for_file(path).await,
            BootstrapStep::WaitPort { iface, ports } => wait_for_port(v, iface, ports).await,
            BootstrapStep::Get { url, dest } => get_request(url, dest).await,
            BootstrapStep::FindAndReplace {
                file,
                find,
                replace,
            } => find_and_replace(file, find, replace, env),
            BootstrapStep::DefineIfNotDefined { key, value } => {
                let defined = env.iter().any(|e| e.starts_with(&format!("{}=", key)));
                if defined {
                    continue;
                }
                let value = expand_from_map(value.clone(), &v.envs_snapshot());
                env.push(format!("{}={}", key, value));

                // new definition may appear in the arguments
                *args = args
                    .iter()
                    .map(|a| expand_from_env(a.clone(), env))
                    .collect();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sleep() {
        assert_eq!(parse("SLEEP 100").unwrap(), BootstrapStep::Sleep(100));
        assert!(parse("SLEEP").is_err());
        assert!(parse("SLEEP abc").is_err());
    }

    #[test]
    fn test_parse_wait_file() {
        assert_eq!(
            parse("WAIT_FILE /tmp/ready").unwrap(),
            BootstrapStep::WaitFile(PathBuf::from("/tmp/ready"))
        );
        assert!(parse("WAIT_FILE").is_err());
        assert!(parse("WAIT_FILE a b").is_err());
    }

    #[test]
    fn test_parse_wait_port() {
        assert_eq!(
            parse("WAIT_PORT if=eth1 80 443").unwrap(),
            BootstrapStep::WaitPort {
                iface: "eth1".into(),
                ports: vec![80, 443],
            }
        );
        // default interface
        assert_eq!(
            parse("WAIT_PORT 8080").unwrap(),
            BootstrapStep::WaitPort {
                iface: "eth0".into(),
                ports: vec![8080],
            }
        );
        assert!(parse("WAIT_PORT if=eth0").is_err());
        assert!(parse("WAIT_PORT notaport").is_err());
    }

    #[test]
    fn test_parse_get() {
        assert_eq!(
            parse("GET http://example.com/f /tmp/f").unwrap(),
            BootstrapStep::Get {
                url: "http://example.com/f".into(),
                dest: PathBuf::from("/tmp/f"),
            }
        );
        assert!(parse("GET http://example.com/f").is_err());
    }

    #[test]
    fn test_parse_find_and_replace() {
        assert_eq!(
            parse("FIND_AND_REPLACE file=/etc/app.conf find=PORT replace=8080").unwrap(),
            BootstrapStep::FindAndReplace {
                file: "/etc/app.conf".into(),
                find: "PORT".into(),
                replace: "8080".into(),
            }
        );
        assert!(parse("FIND_AND_REPLACE file=/etc/app.conf find=PORT").is_err());
        assert!(parse("FIND_AND_REPLACE nonsense").is_err());
    }

    #[test]
    fn test_parse_define() {
        assert_eq!(
            parse("DEFINE_IF_NOT_DEFINED PORT 8080").unwrap(),
            BootstrapStep::DefineIfNotDefined {
                key: "PORT".into(),
                value: "8080".into(),
            }
        );
        assert!(parse("DEFINE_IF_NOT_DEFINED PORT").is_err());
    }

    #[test]
    fn test_unknown_command_rejected_at_parse() {
        assert!(parse("FROBNICATE now").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn test_expand_from_env() {
        let env = vec!["HOST=box1".to_string(), "PORT=99".to_string()];
        assert_eq!(
            expand_from_env("http://$HOST:$PORT/x".into(), &env),
            "http://box1:99/x"
        );
        assert_eq!(expand_from_env("$MISSING".into(), &env), "$MISSING");
    }

    #[test]
    fn test_find_and_replace_applies_env() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.conf");
        std::fs::write(&file, "listen = PLACEHOLDER\n").unwrap();

        let env = vec!["ADDR=0.0.0.0".to_string()];
        find_and_replace(
            file.to_str().unwrap(),
            "PLACEHOLDER",
            "$ADDR",
            &env,
        );

        let out = std::fs::read_to_string(&file).unwrap();
        assert_eq!(out, "listen = 0.0.0.0\n");
    }

    #[tokio::test]
    async fn test_wait_file_releases_when_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready");

        let waiter = {
            let path = path.clone();
            tokio::spawn(async move { wait_for_file(&path).await })
        };

        // blocked while absent
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        std::fs::write(&path, "ok").unwrap();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter must release within a second")
            .unwrap();
    }

    #[tokio::test]
    async fn test_define_if_not_defined() {
        let v = crate::instance::Vinitd::new();
        v.set_env("CLOUD_PROVIDER", "GCP");

        let steps = vec![
            parse("DEFINE_IF_NOT_DEFINED PROVIDER $CLOUD_PROVIDER").unwrap(),
            parse("DEFINE_IF_NOT_DEFINED EXISTING other").unwrap(),
        ];
        let mut env = vec!["EXISTING=yes".to_string()];
        let mut args = vec!["--provider".to_string(), "$PROVIDER".to_string()];

        run(&v, &steps, &mut env, &mut args).await;

        assert!(env.contains(&"PROVIDER=GCP".to_string()));
        // existing key untouched
        assert_eq!(env.iter().filter(|e| e.starts_with("EXISTING=")).count(), 1);
        assert!(env.contains(&"EXISTING=yes".to_string()));
        // args re-substituted
        assert_eq!(args[1], "GCP");
    }
}
