use clap::{Parser, Subcommand, ValueEnum};
use marlink_metadata::{FilterMode, InstanceConfig};
use std::net::SocketAddr;
use std::path::PathBuf;

/// marlink: ADS-B / AIS record forwarder for the onboard Pi
#[derive(Parser, Debug)]
#[command(name = "marlink")]
pub struct Args {
    /// Directory holding adsb.yaml, ais.yaml and their backups/
    #[arg(long, env = "MARLINK_CONFIG_DIR", default_value = "/etc/marlink", global = true)]
    pub config_dir: PathBuf,

    /// Control plane bind address
    #[arg(long, env = "MARLINK_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: SocketAddr,

    /// Leave both engines stopped until started through the control plane
    #[arg(long, default_value_t = false)]
    pub no_autostart: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run both engines and the HTTP control plane (default)
    Serve,
    /// Print the effective configuration of an instance
    Config {
        #[arg(long, value_enum)]
        instance: Instance,
    },
    /// Edit the endpoint list offline
    Endpoint {
        #[command(subcommand)]
        action: EndpointAction,
    },
    /// Edit the forwarding filter offline
    Filter {
        #[command(subcommand)]
        action: FilterAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum EndpointAction {
    List {
        #[arg(long, value_enum)]
        instance: Instance,
    },
    Add {
        #[arg(long, value_enum)]
        instance: Instance,
        #[arg(long)]
        name: String,
        #[arg(long)]
        ip: String,
        #[arg(long)]
        port: u16,
        /// Store the endpoint disabled
        #[arg(long, default_value_t = false)]
        disabled: bool,
    },
    Update {
        #[arg(long, value_enum)]
        instance: Instance,
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        ip: String,
        #[arg(long)]
        port: u16,
        #[arg(long, default_value_t = false)]
        disabled: bool,
    },
    Remove {
        #[arg(long, value_enum)]
        instance: Instance,
        id: String,
    },
    Toggle {
        #[arg(long, value_enum)]
        instance: Instance,
        id: String,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum FilterAction {
    Set {
        #[arg(long, value_enum)]
        instance: Instance,
        #[arg(long, value_enum)]
        mode: ModeArg,
        /// Comma-separated ICAO codes for allow-list mode
        #[arg(long, value_delimiter = ',')]
        identifiers: Vec<String>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instance {
    Adsb,
    Ais,
}

impl Instance {
    pub const ALL: [Instance; 2] = [Instance::Adsb, Instance::Ais];

    pub fn file_name(&self) -> &'static str {
        match self {
            Instance::Adsb => "adsb.yaml",
            Instance::Ais => "ais.yaml",
        }
    }

    pub fn defaults(&self) -> InstanceConfig {
        match self {
            Instance::Adsb => InstanceConfig::adsb_defaults(),
            Instance::Ais => InstanceConfig::ais_defaults(),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    All,
    AllowList,
}

impl From<ModeArg> for FilterMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::All => FilterMode::All,
            ModeArg::AllowList => FilterMode::AllowList,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_serve() {
        let args = Args::try_parse_from(["marlink", "--config-dir", "/tmp/marlink"]).unwrap();
        assert_eq!(args.config_dir, PathBuf::from("/tmp/marlink"));
        assert_eq!(args.http_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert!(!args.no_autostart);
        assert!(args.command.is_none());
    }

    #[test]
    fn test_endpoint_add() {
        let args = Args::try_parse_from([
            "marlink", "endpoint", "add", "--instance", "ais", "--name", "Shore", "--ip",
            "10.0.0.5", "--port", "10110",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Some(Command::Endpoint {
                action: EndpointAction::Add {
                    instance: Instance::Ais,
                    name: "Shore".to_string(),
                    ip: "10.0.0.5".to_string(),
                    port: 10110,
                    disabled: false,
                }
            })
        );
    }

    #[test]
    fn test_filter_identifiers_split_on_comma() {
        let args = Args::try_parse_from([
            "marlink", "filter", "set", "--instance", "adsb", "--mode", "allow-list",
            "--identifiers", "A92F2D,4CA2B1",
        ])
        .unwrap();
        match args.command {
            Some(Command::Filter {
                action: FilterAction::Set { mode, identifiers, .. },
            }) => {
                assert_eq!(mode, ModeArg::AllowList);
                assert_eq!(identifiers, vec!["A92F2D", "4CA2B1"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_port_out_of_range_rejected() {
        let result = Args::try_parse_from([
            "marlink", "endpoint", "add", "--instance", "adsb", "--name", "x", "--ip", "10.0.0.1",
            "--port", "70000",
        ]);
        assert!(result.is_err());
    }
}
