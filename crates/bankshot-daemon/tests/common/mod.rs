//! Shared test support: a mock `ssh` binary.
//!
//! The script records every invocation to a log file, answers `-G` with a
//! `controlpath` pointing at a real unix socket, and reports success for
//! `-O check/forward/cancel`. A failing variant rejects forward requests
//! the way a dead mux would.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

pub struct MockSsh {
    pub script: PathBuf,
    pub log: PathBuf,
    pub control_socket: PathBuf,
    // Keeps the control socket path alive as a real AF_UNIX socket.
    _listener: UnixListener,
}

impl MockSsh {
    pub fn new(dir: &Path) -> MockSsh {
        Self::with_behavior(dir, Behavior::Succeed)
    }

    pub fn failing_forwards(dir: &Path) -> MockSsh {
        Self::with_behavior(dir, Behavior::FailForwards)
    }

    fn with_behavior(dir: &Path, behavior: Behavior) -> MockSsh {
        let script = dir.join("ssh");
        let log = dir.join("ssh-invocations.log");
        let control_socket = dir.join("control.sock");
        let listener = UnixListener::bind(&control_socket).expect("bind mock control socket");

        let forward_case = match behavior {
            Behavior::Succeed => r#"echo "Forward established: $FORWARD""#,
            Behavior::FailForwards => {
                r#"echo "mux_client_forward: forwarding request failed" >&2; exit 255"#
            }
        };

        let body = format!(
            r#"#!/usr/bin/env bash
echo "$@" >> {log}
OPERATION=""
FORWARD=""
while [ $# -gt 0 ]; do
    case "$1" in
        -O) shift; OPERATION=$1 ;;
        -L) shift; FORWARD=$1 ;;
        -G)
            echo "hostname testhost"
            echo "user testuser"
            echo "port 22"
            echo "controlpath {controlpath}"
            exit 0
            ;;
        *) CONNECTION=$1 ;;
    esac
    shift
done

case "$OPERATION" in
    check) echo "Master running (pid=100)" >&2; exit 0 ;;
    forward) {forward_case}; exit 0 ;;
    cancel) echo "Forward cancelled: $FORWARD"; exit 0 ;;
    *) echo "unknown operation: $OPERATION" >&2; exit 1 ;;
esac
"#,
            log = log.display(),
            controlpath = control_socket.display(),
            forward_case = forward_case,
        );

        std::fs::write(&script, body).expect("write mock ssh script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod mock ssh script");

        MockSsh {
            script,
            log,
            control_socket,
            _listener: listener,
        }
    }

    /// Every recorded invocation, one argv line each.
    pub fn invocations(&self) -> Vec<String> {
        std::fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn command(&self) -> String {
        self.script.display().to_string()
    }
}

enum Behavior {
    Succeed,
    FailForwards,
}
