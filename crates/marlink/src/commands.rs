//! Offline subcommands: inspect and edit the instance files without a
//! running daemon. Edits go through the registry so each one leaves a backup.

use anyhow::Context;
use marlink_metadata::{EndpointRegistry, FilterPolicy, NewEndpoint};
use std::io::Write;
use std::path::Path;

use crate::cli::{Command, EndpointAction, FilterAction, Instance};

pub fn open_registry(config_dir: &Path, instance: Instance) -> anyhow::Result<EndpointRegistry> {
    let path = config_dir.join(instance.file_name());
    EndpointRegistry::open(&path, instance.defaults())
        .with_context(|| format!("failed to open {}", path.display()))
}

pub fn run(config_dir: &Path, command: Command, out: &mut impl Write) -> anyhow::Result<()> {
    match command {
        Command::Serve => anyhow::bail!("serve is not an offline command"),
        Command::Config { instance } => {
            let registry = open_registry(config_dir, instance)?;
            write!(out, "{}", registry.config().to_yaml()?)?;
        }
        Command::Endpoint { action } => endpoint(config_dir, action, out)?,
        Command::Filter {
            action:
                FilterAction::Set {
                    instance,
                    mode,
                    identifiers,
                },
        } => {
            let registry = open_registry(config_dir, instance)?;
            let applied = registry.set_filter(FilterPolicy {
                mode: mode.into(),
                identifiers,
            })?;
            writeln!(out, "filter: {}", applied)?;
        }
    }
    Ok(())
}

fn endpoint(config_dir: &Path, action: EndpointAction, out: &mut impl Write) -> anyhow::Result<()> {
    match action {
        EndpointAction::List { instance } => {
            let registry = open_registry(config_dir, instance)?;
            for endpoint in registry.list() {
                writeln!(
                    out,
                    "{:<12} {:<20} {:<21} {}",
                    endpoint.id,
                    endpoint.name,
                    endpoint.address(),
                    if endpoint.enabled { "enabled" } else { "disabled" }
                )?;
            }
        }
        EndpointAction::Add {
            instance,
            name,
            ip,
            port,
            disabled,
        } => {
            let registry = open_registry(config_dir, instance)?;
            let mut new = NewEndpoint::new(name, ip, port);
            new.enabled = !disabled;
            let endpoint = registry.add(new)?;
            writeln!(out, "added {}", endpoint.id)?;
        }
        EndpointAction::Update {
            instance,
            id,
            name,
            ip,
            port,
            disabled,
        } => {
            let registry = open_registry(config_dir, instance)?;
            let mut new = NewEndpoint::new(name, ip, port);
            new.enabled = !disabled;
            let endpoint = registry.update(&id, new)?;
            writeln!(out, "updated {}", endpoint)?;
        }
        EndpointAction::Remove { instance, id } => {
            let removed = open_registry(config_dir, instance)?.delete(&id)?;
            writeln!(out, "removed {}", removed.id)?;
        }
        EndpointAction::Toggle { instance, id } => {
            let endpoint = open_registry(config_dir, instance)?.toggle(&id)?;
            writeln!(
                out,
                "{} {}",
                endpoint.id,
                if endpoint.enabled { "enabled" } else { "disabled" }
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::ModeArg;
    use marlink_metadata::{FilterMode, InstanceConfig, MetadataError};
    use tempfile::TempDir;

    fn run_to_string(dir: &Path, command: Command) -> anyhow::Result<String> {
        let mut out = Vec::new();
        run(dir, command, &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_config_prints_defaults_and_creates_file() {
        let tmp = TempDir::new().unwrap();
        let printed = run_to_string(
            tmp.path(),
            Command::Config {
                instance: Instance::Ais,
            },
        )
        .unwrap();

        let parsed = InstanceConfig::from_yaml(&printed).unwrap();
        assert_eq!(parsed, InstanceConfig::ais_defaults());
        assert!(tmp.path().join("ais.yaml").exists());
    }

    #[test]
    fn test_add_list_remove() {
        let tmp = TempDir::new().unwrap();
        let added = run_to_string(
            tmp.path(),
            Command::Endpoint {
                action: EndpointAction::Add {
                    instance: Instance::Adsb,
                    name: "Shore".to_string(),
                    ip: "10.0.0.5".to_string(),
                    port: 10110,
                    disabled: false,
                },
            },
        )
        .unwrap();
        assert_eq!(added, "added ENDPOINT_1\n");

        let listed = run_to_string(
            tmp.path(),
            Command::Endpoint {
                action: EndpointAction::List {
                    instance: Instance::Adsb,
                },
            },
        )
        .unwrap();
        assert!(listed.contains("ENDPOINT_1"));
        assert!(listed.contains("10.0.0.5:10110"));
        assert!(listed.trim_end().ends_with("enabled"));

        run_to_string(
            tmp.path(),
            Command::Endpoint {
                action: EndpointAction::Remove {
                    instance: Instance::Adsb,
                    id: "ENDPOINT_1".to_string(),
                },
            },
        )
        .unwrap();
        let registry = open_registry(tmp.path(), Instance::Adsb).unwrap();
        assert!(registry.list().is_empty());
        assert_eq!(std::fs::read_dir(registry.backup_dir()).unwrap().count(), 2);
    }

    #[test]
    fn test_toggle_unknown_id_fails() {
        let tmp = TempDir::new().unwrap();
        let err = run_to_string(
            tmp.path(),
            Command::Endpoint {
                action: EndpointAction::Toggle {
                    instance: Instance::Adsb,
                    id: "ENDPOINT_7".to_string(),
                },
            },
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MetadataError>(),
            Some(MetadataError::NotFound(_))
        ));
    }

    #[test]
    fn test_filter_set() {
        let tmp = TempDir::new().unwrap();
        let printed = run_to_string(
            tmp.path(),
            Command::Filter {
                action: FilterAction::Set {
                    instance: Instance::Adsb,
                    mode: ModeArg::AllowList,
                    identifiers: vec!["a92f2d".to_string()],
                },
            },
        )
        .unwrap();
        assert!(printed.starts_with("filter: "));

        let config = open_registry(tmp.path(), Instance::Adsb).unwrap().config();
        assert_eq!(config.filter.mode, FilterMode::AllowList);
    }
}
