use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The network configuration a plugin invocation passes on stdin. Only the
/// fields the daemon acts on are modeled; the rest of the document is the
/// plugin's business.
#[derive(Debug, Clone, Deserialize)]
pub struct NetConf {
    pub name: String,
    #[serde(default)]
    pub ipam: IpamConf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpamConf {
    #[serde(default)]
    pub provide: Vec<ProvideOption>,
    #[serde(default)]
    pub request: Vec<RequestOption>,
}

/// An option the client announces to the server. The value comes from the
/// configuration directly or is looked up in the CNI args at request time;
/// `from_arg` wins when both are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvideOption {
    pub option: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default, rename = "fromArg")]
    pub from_arg: Option<String>,
}

/// An option the client asks the server to include in its replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOption {
    #[serde(default, rename = "skipDefault")]
    pub skip_default: bool,
    #[serde(default)]
    pub option: String,
}

impl NetConf {
    pub fn parse(stdin_data: &str) -> Result<Self> {
        let conf: NetConf = serde_json::from_str(stdin_data)
            .map_err(|error| Error::ConfigInvalid(format!("error parsing netconf: {}", error)))?;
        if conf.name.is_empty() {
            return Err(Error::ConfigInvalid(
                "network configuration has no name".to_string(),
            ));
        }
        Ok(conf)
    }
}

/// One RPC invocation's arguments, mirroring what the plugin receives from
/// the container runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdArgs {
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub netns: String,
    #[serde(rename = "ifName")]
    pub if_name: String,
    #[serde(default)]
    pub args: String,
    #[serde(default, rename = "stdinData")]
    pub stdin_data: String,
}

/// Parses the CNI args string (`KEY=value;KEY2=value2`). Entries without an
/// `=` are ignored, matching how runtimes pass free-form args.
pub fn parse_cni_args(args: &str) -> BTreeMap<String, String> {
    args.split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub lease_file: PathBuf,
    /// Prefix prepended to every host path the daemon touches (the socket
    /// bind path and each namespace path a request names), for daemons
    /// running with the host filesystem mounted under a subdirectory.
    pub hostprefix: String,
    pub pidfile: Option<PathBuf>,
    /// Per-try timeout for each DHCP exchange.
    pub timeout: Duration,
    /// Cumulative retry budget for one acquisition.
    pub resend_max: Duration,
    pub broadcast: bool,
}

impl DaemonConfig {
    /// The socket path as seen from this process, with the host prefix
    /// applied. Not used when a listener arrives via socket activation.
    pub fn host_socket_path(&self) -> PathBuf {
        if self.hostprefix.is_empty() {
            return self.socket_path.clone();
        }
        PathBuf::from(format!(
            "{}{}",
            self.hostprefix,
            self.socket_path.display()
        ))
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(pidfile) = &self.pidfile
            && !pidfile.is_absolute()
        {
            return Err(Error::ConfigInvalid(format!(
                "pidfile {:?}: path not absolute",
                pidfile
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::ConfigInvalid(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if self.resend_max < self.timeout {
            return Err(Error::ConfigInvalid(
                "resend-max must be at least the per-try timeout".to_string(),
            ));
        }
        Ok(())
    }
}
