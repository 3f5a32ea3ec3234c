//! iSCSI initiator adapter wrapping `iscsiadm`.

use std::fs;
use std::io;
use std::process::Command;

use tonic::Status;
use tracing::{debug, info};

const INITIATOR_NAME_PATH: &str = "/etc/iscsi/initiatorname.iscsi";

/// An established iSCSI session as reported by the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiSession {
    pub portal: String,
    pub target: String,
}

/// Initiator-side iSCSI operations the node service needs.
///
/// Implementations shell out on real nodes; tests substitute fakes.
pub trait IscsiInitiator: Send + Sync {
    /// SendTargets discovery against a portal, returning the target IQNs it
    /// advertises.
    fn discover(&self, portal: &str) -> Result<Vec<String>, Status>;

    /// Currently established sessions.
    fn sessions(&self) -> Result<Vec<IscsiSession>, Status>;

    /// Log in to a target through the given portal. Logging in to a target
    /// that already has a session is not an error.
    fn login(&self, target_iqn: &str, portal: &str) -> Result<(), Status>;
}

/// Production initiator backed by open-iscsi's `iscsiadm`.
pub struct OpenIscsi;

impl OpenIscsi {
    fn run(args: &[&str]) -> Result<std::process::Output, Status> {
        debug!(args = ?args, "running iscsiadm");
        Command::new("iscsiadm")
            .args(args)
            .output()
            .map_err(|e| Status::internal(format!("Failed to execute iscsiadm: {e}")))
    }
}

impl IscsiInitiator for OpenIscsi {
    fn discover(&self, portal: &str) -> Result<Vec<String>, Status> {
        let output = Self::run(&["-m", "discovery", "-t", "sendtargets", "-p", portal])?;
        if !output.status.success() {
            return Err(Status::internal(format!(
                "iSCSI discovery against {} failed: {}",
                portal,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(parse_discovery_output(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    fn sessions(&self) -> Result<Vec<IscsiSession>, Status> {
        let output = Self::run(&["-m", "session"])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // iscsiadm exits non-zero when no sessions exist.
            if stderr.contains("No active sessions") {
                return Ok(Vec::new());
            }
            return Err(Status::internal(format!(
                "Failed to list iSCSI sessions: {stderr}"
            )));
        }
        Ok(parse_session_output(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    fn login(&self, target_iqn: &str, portal: &str) -> Result<(), Status> {
        let output = Self::run(&["-m", "node", "-T", target_iqn, "-p", portal, "--login"])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already exists") || stderr.contains("already present") {
                debug!(target = %target_iqn, "session already established");
                return Ok(());
            }
            return Err(Status::internal(format!(
                "iSCSI login to {target_iqn} via {portal} failed: {stderr}"
            )));
        }
        info!(target = %target_iqn, portal = %portal, "iSCSI session established");
        Ok(())
    }
}

/// Parse `iscsiadm -m discovery` output. Each line looks like
/// `10.0.0.1:3260,1 iqn.1992-08.com.netapp:5700.600a098000f63714`.
fn parse_discovery_output(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

/// Parse `iscsiadm -m session` output. Each line looks like
/// `tcp: [1] 10.0.0.1:3260,1 iqn.1992-08.com.netapp:5700 (non-flash)`.
fn parse_session_output(stdout: &str) -> Vec<IscsiSession> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let transport = fields.next()?;
            if !transport.starts_with("tcp") {
                return None;
            }
            let _sid = fields.next()?;
            let portal = fields.next()?;
            let target = fields.next()?;
            let portal = portal.split(',').next().unwrap_or(portal);
            Some(IscsiSession {
                portal: portal.to_string(),
                target: target.to_string(),
            })
        })
        .collect()
}

/// Read this node's initiator IQN from the open-iscsi configuration.
pub fn read_initiator_name() -> io::Result<String> {
    let content = fs::read_to_string(INITIATOR_NAME_PATH)?;
    initiator_name_from(&content).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no InitiatorName entry in {INITIATOR_NAME_PATH}"),
        )
    })
}

fn initiator_name_from(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix("InitiatorName="))
        .map(|iqn| iqn.trim().to_string())
        .filter(|iqn| !iqn.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_discovery_output() {
        let out = "10.0.0.1:3260,1 iqn.1992-08.com.netapp:5700.a\n\
                   10.0.0.2:3260,2 iqn.1992-08.com.netapp:5700.b\n";
        let targets = parse_discovery_output(out);
        assert_eq!(
            targets,
            vec![
                "iqn.1992-08.com.netapp:5700.a".to_string(),
                "iqn.1992-08.com.netapp:5700.b".to_string()
            ]
        );
        assert!(parse_discovery_output("").is_empty());
    }

    #[test]
    fn test_parse_session_output() {
        let out = "tcp: [1] 10.0.0.1:3260,1 iqn.1992-08.com.netapp:5700.a (non-flash)\n\
                   tcp: [2] 10.0.0.2:3260,1 iqn.1992-08.com.netapp:5700.b (non-flash)\n";
        let sessions = parse_session_output(out);
        assert_eq!(sessions.len(), 2);
        assert_eq!(
            sessions[0],
            IscsiSession {
                portal: "10.0.0.1:3260".to_string(),
                target: "iqn.1992-08.com.netapp:5700.a".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_session_output_ignores_garbage() {
        assert!(parse_session_output("iscsiadm: No active sessions.\n").is_empty());
        assert!(parse_session_output("").is_empty());
    }

    #[test]
    fn test_initiator_name_from_config() {
        let content = "## DO NOT EDIT OR REMOVE THIS FILE!\n\
                       # comment\n\
                       InitiatorName=iqn.1994-05.com.redhat:abc123\n";
        assert_eq!(
            initiator_name_from(content).as_deref(),
            Some("iqn.1994-05.com.redhat:abc123")
        );
        assert_eq!(initiator_name_from("# only comments\n"), None);
        assert_eq!(initiator_name_from("InitiatorName=\n"), None);
    }
}
