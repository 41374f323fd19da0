//! Process supervision: launch the declared programs, reap children and
//! shut the machine down when the last one exits.

pub mod bootstrap;
pub mod reaper;

use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use caps::{CapSet, Capability};
use vinitd_shared::{VinitdError, VinitdResult};

use crate::console::announce;
use crate::instance::{Program, Vinitd, DEFAULT_CWD, DEFAULT_TTY, ROOT_ID, USER_ID};
use crate::power;
use crate::vcfg::Privilege;
use bootstrap::expand_from_env;

const STRACE_BIN: &str = "/vorteil/strace";
const BUSYBOX_BIN: &str = "/vorteil/busybox";

/// Ambient capabilities granted to superuser programs.
const SUPERUSER_CAPS: &[Capability] = &[
    Capability::CAP_CHOWN,
    Capability::CAP_DAC_OVERRIDE,
    Capability::CAP_DAC_READ_SEARCH,
    Capability::CAP_FOWNER,
    Capability::CAP_IPC_OWNER,
    Capability::CAP_NET_ADMIN,
    Capability::CAP_MKNOD,
    Capability::CAP_NET_BIND_SERVICE,
    Capability::CAP_NET_RAW,
    Capability::CAP_SYS_ADMIN,
];

/// Value of `key` inside a `KEY=VALUE` environment list.
pub fn pick_from_env(env: &[String], key: &str) -> Option<String> {
    env.iter().find_map(|e| {
        let (k, v) = e.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

/// Materialize a program environment: `$KEY` tokens resolve against the
/// hypervisor envs, which are then appended as entries of their own.
pub fn materialize_env(declared: &[String], hv_envs: &HashMap<String, String>) -> Vec<String> {
    let mut out: Vec<String> = declared
        .iter()
        .map(|e| bootstrap::expand_from_map(e.clone(), hv_envs))
        .collect();

    for (k, v) in hv_envs {
        out.push(format!("{}={}", k, v));
    }

    out
}

/// Substitute `$KEY` tokens in the arguments against the materialized
/// environment.
pub fn materialize_args(declared: &[String], env: &[String]) -> Vec<String> {
    declared
        .iter()
        .map(|a| expand_from_env(a.clone(), env))
        .collect()
}

/// Resolve the executable path: absolute as-is, then relative to the
/// working directory, then each directory of the program's own `$PATH`.
pub fn calculate_path(binary: &str, cwd: &str, env: &[String]) -> Option<String> {
    if binary.starts_with('/') {
        return Some(binary.to_string());
    }

    let joined = Path::new(cwd).join(binary);
    if joined.exists() {
        return match joined.canonicalize() {
            Ok(p) => Some(p.to_string_lossy().into_owned()),
            Err(e) => {
                tracing::error!("can not create path for {}, err {}", binary, e);
                Some(format!("/{}", binary))
            }
        };
    }

    if let Some(path_env) = pick_from_env(env, "PATH") {
        for dir in path_env.split(':') {
            let candidate = Path::new(dir).join(binary);
            if candidate.exists() {
                return Some(candidate.to_string_lossy().into_owned());
            }
        }
    }

    None
}

fn open_stdio(path: &str, create: bool) -> VinitdResult<std::fs::File> {
    if let Some(dir) = Path::new(path).parent() {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
    }

    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).append(true);
    if create {
        opts.create(true);
    }
    opts.open(path).map_err(VinitdError::Io)
}

fn launch_child(program: &Arc<Program>, system_user: &str) -> VinitdResult<()> {
    let cfg = &program.cfg;
    let state = program.state.lock();

    let (mut path, mut args) = (state.path.clone(), state.args.clone());
    let env = state.env.clone();
    drop(state);

    // strace wrap: tracer becomes argv[0], original command follows
    if cfg.strace {
        args.insert(0, path);
        path = STRACE_BIN.to_string();
    }

    let (user, rid) = match cfg.privilege {
        Privilege::Superuser => (format!("{} (superuser)", system_user), USER_ID),
        Privilege::User => (system_user.to_string(), USER_ID),
        Privilege::Root => ("root".to_string(), ROOT_ID),
    };
    tracing::debug!("starting as {}, uid {}", user, rid);

    let cwd = if cfg.cwd.is_empty() {
        DEFAULT_CWD
    } else {
        cfg.cwd.as_str()
    };

    let stderr_path = if cfg.stderr.is_empty() {
        DEFAULT_TTY
    } else {
        cfg.stderr.as_str()
    };
    let stdout_path = if cfg.stdout.is_empty() {
        DEFAULT_TTY
    } else {
        cfg.stdout.as_str()
    };

    let stderr = open_stdio(stderr_path, false)?;
    let stdout = open_stdio(stdout_path, true)?;

    let mut cmd = std::process::Command::new(&path);
    cmd.args(&args)
        .env_clear()
        .envs(env.iter().filter_map(|e| e.split_once('=')))
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .stdout(stdout)
        .stderr(stderr);

    let superuser = cfg.privilege == Privilege::Superuser;
    unsafe {
        cmd.pre_exec(move || {
            if superuser {
                // keep permitted caps across the uid switch
                if libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            if libc::setgid(rid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setuid(rid) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            if superuser {
                for cap in SUPERUSER_CAPS {
                    caps::raise(None, CapSet::Inheritable, *cap)
                        .and_then(|_| caps::raise(None, CapSet::Ambient, *cap))
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                }
            }

            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| map_spawn_error(e, &path))?;

    let pid = child.id() as i32;
    program.state.lock().pid = Some(pid);
    tracing::debug!("started {} as pid {}", path, pid);

    // the global reaper collects the exit status; the handle is not
    // waited on
    std::mem::forget(child);

    Ok(())
}

fn map_spawn_error(e: std::io::Error, path: &str) -> VinitdError {
    if e.kind() == std::io::ErrorKind::NotFound {
        // a missing binary or a missing dynamic linker look the same
        if Path::new(path).exists() {
            return VinitdError::Launch(format!("ld linker missing for {}", path));
        }
        return VinitdError::Launch(format!("{} application missing", path));
    }
    VinitdError::Launch(e.to_string())
}

/// Parse and register the declared programs in declaration order.
pub fn prep_programs(v: &Arc<Vinitd>) -> VinitdResult<()> {
    let declared = v.vcfg.read().programs.clone();
    let mut programs = v.programs.write();
    for (index, cfg) in declared.into_iter().enumerate() {
        programs.push(Arc::new(Program::new(index, cfg)?));
    }
    Ok(())
}

/// Materialize env/args/path, run the bootstrap preconditions and exec.
async fn launch_program(v: &Arc<Vinitd>, program: &Arc<Program>) -> VinitdResult<()> {
    let hv_envs = v.envs_snapshot();

    let mut env = materialize_env(&program.cfg.env, &hv_envs);
    let mut args = materialize_args(&program.cfg.args, &env);

    let cwd = if program.cfg.cwd.is_empty() {
        DEFAULT_CWD
    } else {
        program.cfg.cwd.as_str()
    };

    let path = calculate_path(&program.cfg.binary, cwd, &env).ok_or_else(|| {
        tracing::error!("application {} does not exist", program.cfg.binary);
        VinitdError::Launch(format!("program {} can not be found", program.cfg.binary))
    })?;

    announce(&format!("launching {}", path));

    bootstrap::run(v, &program.bootstrap, &mut env, &mut args).await;

    tracing::debug!("launch args {:?}", args);
    tracing::debug!("launch envs {:?}", env);

    {
        let mut state = program.state.lock();
        state.path = path;
        state.env = env;
        state.args = args;
    }

    let system_user = v.user.read().clone();
    let program = program.clone();
    tokio::task::spawn_blocking(move || launch_child(&program, &system_user))
        .await
        .map_err(|e| VinitdError::Internal(e.to_string()))?
}

/// Start every program. Exit-event subscription comes first so an early
/// exit can never be lost; any launch failure is fatal.
pub async fn launch_all(v: &Arc<Vinitd>) -> VinitdResult<()> {
    let programs = v.programs.read().clone();
    tracing::debug!("starting {} programs", programs.len());

    reaper::listen_to_processes(v.clone());
    reaper::reap_children(v.clone());

    let tasks = programs.iter().map(|p| launch_program(v, p));
    futures::future::try_join_all(tasks).await?;

    tracing::debug!("all apps started");
    v.set_status(crate::instance::InitStatus::Launched);

    Ok(())
}

/// Populate /bin and /usr/bin with applet symlinks when the busybox
/// bundle is present.
pub fn run_busybox_script() -> VinitdResult<()> {
    if !Path::new(BUSYBOX_BIN).exists() {
        return Ok(());
    }

    let dirs = [PathBuf::from("/bin"), PathBuf::from("/usr/bin")];
    for d in &dirs {
        std::fs::create_dir_all(d)?;
    }

    let out = std::process::Command::new(BUSYBOX_BIN)
        .arg("--list")
        .output()
        .map_err(|e| VinitdError::Internal(format!("busybox list failed: {}", e)))?;

    for app in String::from_utf8_lossy(&out.stdout).lines() {
        if app.is_empty() || app == "[" || app == "[[" {
            continue;
        }
        for d in &dirs {
            let target = d.join(app);
            if !target.exists() {
                std::os::unix::fs::symlink(BUSYBOX_BIN, &target)?;
            }
        }
    }

    Ok(())
}

/// Power-off when nothing is left to supervise: no foreign user
/// processes and every program has exited.
pub fn handle_exit(v: &Arc<Vinitd>) {
    let mut count = reaper::count_user_processes();

    for p in v.programs.read().iter() {
        if p.pid().is_none() || !p.has_exited() {
            count += 1;
        }
    }

    if count == 0 {
        if v.status() != crate::instance::InitStatus::Poweroff {
            announce("no programs still running");
            v.instant_shutdown
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
        power::shutdown(v, power::RebootAction::PowerOff);
    }
}
