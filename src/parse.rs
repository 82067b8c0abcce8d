// Request construction from command line arguments and configuration

use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::binding::{Address, Header, HostApi, HostRequest, Namespace, Request};
use crate::config::{expand_home, Config};
use crate::fuse::MountOptions;

/// Raw `mount` arguments. Lists are comma separated; anything left out is
/// filled from the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountArgs {
    pub api: Option<String>,
    pub namespaces: Option<String>,
    pub targets: Option<String>,
}

fn split_list(list: &str) -> Vec<&str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()
}

/// Build one request per namespace for a single host API.
pub fn parse_requests(args: &MountArgs, config: &Config) -> Result<Vec<Request>> {
    let api = match &args.api {
        Some(api) => {
            let apis = split_list(api);
            let [api] = apis.as_slice() else {
                bail!("exactly one host API must be given per call, got {}", apis.len());
            };
            api.parse::<HostApi>()?
        }
        None => config.mount.api,
    };

    let namespaces = match &args.namespaces {
        Some(list) => split_list(list)
            .into_iter()
            .map(str::parse::<Namespace>)
            .collect::<Result<Vec<_>, _>>()?,
        None => config.mount.namespaces.clone(),
    };
    if namespaces.is_empty() {
        bail!("no namespaces to mount");
    }

    let targets: Vec<String> = match &args.targets {
        Some(list) => split_list(list).into_iter().map(str::to_string).collect(),
        None => namespaces.iter().map(|ns| config.target_for(*ns).to_string()).collect(),
    };
    if targets.len() != namespaces.len() {
        bail!(
            "number of targets ({}) does not match number of namespaces ({})",
            targets.len(),
            namespaces.len()
        );
    }

    namespaces
        .into_iter()
        .zip(targets)
        .map(|(namespace, target)| {
            let header = Header::new(api, namespace);
            let host = match api {
                HostApi::Fuse => fuse_request(namespace, &target, config),
                HostApi::NineP => ninep_request(namespace, &target, config),
            }
            .with_context(|| format!("invalid target {target:?} for {header}"))?;
            Ok(Request::new(header, host))
        })
        .collect()
}

/// Host path for `target`, made absolute against the working directory.
fn host_path(target: &str) -> Result<Address> {
    let target = expand_home(target);
    let path = Path::new(&target);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().context("Failed to resolve working directory")?.join(path)
    };
    let absolute = absolute.to_str().context("target path is not valid UTF-8")?;
    Ok(Address::host_path(absolute)?)
}

fn fuse_request(namespace: Namespace, target: &str, config: &Config) -> Result<HostRequest> {
    let address = match target.strip_prefix("/host") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => target.parse::<Address>()?,
        _ => host_path(target)?,
    };
    let options = MountOptions {
        allow_other: config.fuse.allow_other,
        allow_root: false,
        read_only: config.fuse.read_only,
        fsname: Some(namespace.as_str().to_string()),
        auto_unmount: config.fuse.auto_unmount,
        extra: Vec::new(),
    };
    Ok(HostRequest::new(address).with_arguments(options.to_arguments()))
}

fn is_listener_form(target: &str) -> bool {
    ["/unix/", "/ip4/", "/ip6/"].iter().any(|prefix| target.starts_with(prefix))
}

fn ninep_request(namespace: Namespace, target: &str, config: &Config) -> Result<HostRequest> {
    let expanded = expand_home(target);
    if is_listener_form(&expanded) {
        let address: Address = expanded.parse()?;
        if !address.is_listener() {
            bail!("{address} is not a listener address");
        }
        return Ok(HostRequest::new(address));
    }

    let address = match expanded.strip_prefix("/host") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => expanded.parse::<Address>()?,
        _ => host_path(&expanded)?,
    };
    Ok(HostRequest::new(address).with_arguments([config.listener_for(namespace)]))
}
