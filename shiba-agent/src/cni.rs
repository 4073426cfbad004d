//! One-shot CNI network configuration writer: emits a CNI conflist
//! describing the pod network (ptp + host-local, with portmap + SNAT)
//! so the container runtime knows how to wire up pod interfaces.

use std::path::{Path, PathBuf};

use serde_json::json;

pub const CNI_CONFIG_FILENAME: &str = "10-shiba.conflist";
const NETWORK_NAME: &str = "shiba-net";

/// Write the conflist to `cni_config_path`, then scan the directory for
/// any other `.conf`/`.conflist` file and warn about it — a stray config
/// with a lexically earlier name silently pre-empts ours.
pub fn write_cni_config(
    cni_config_path: &Path,
    local_subnets: &[crate::model::Subnet],
) -> std::io::Result<()> {
    std::fs::create_dir_all(cni_config_path)?;
    let conflist = build_conflist(local_subnets);
    let path = cni_config_path.join(CNI_CONFIG_FILENAME);
    std::fs::write(&path, serde_json::to_vec_pretty(&conflist)?)?;
    tracing::info!(path = %path.display(), "wrote CNI configuration");
    warn_about_colliding_configs(cni_config_path, &path);
    Ok(())
}

fn build_conflist(local_subnets: &[crate::model::Subnet]) -> serde_json::Value {
    let has_v4 = local_subnets.iter().any(|s| matches!(s.0, ipnet::IpNet::V4(_)));
    let has_v6 = local_subnets.iter().any(|s| matches!(s.0, ipnet::IpNet::V6(_)));

    let ranges: Vec<_> = local_subnets
        .iter()
        .map(|s| json!([{ "subnet": s.canonical_string() }]))
        .collect();

    let mut routes = Vec::new();
    if has_v4 {
        routes.push(json!({ "dst": "0.0.0.0/0" }));
    }
    if has_v6 {
        routes.push(json!({ "dst": "::/0" }));
    }

    json!({
        "cniVersion": "0.3.1",
        "name": NETWORK_NAME,
        "plugins": [
            {
                "type": "ptp",
                "ipMasq": false,
                "mtu": 1450,
                "ipam": {
                    "type": "host-local",
                    "ranges": ranges,
                    "routes": routes,
                },
            },
            {
                "type": "portmap",
                "snat": true,
                "capabilities": { "portMappings": true },
            },
        ],
    })
}

fn warn_about_colliding_configs(dir: &Path, ours: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to scan CNI config directory for collisions");
            return;
        }
    };
    for entry in entries.flatten() {
        let path: PathBuf = entry.path();
        if path == ours {
            continue;
        }
        let is_cni_config = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ext == "conf" || ext == "conflist");
        if is_cni_config {
            tracing::warn!(
                other = %path.display(),
                "another CNI configuration file is present and may pre-empt ours depending on lexical order"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_subnets;

    #[test]
    fn writes_expected_file_with_local_subnet() {
        let dir = std::env::temp_dir().join(format!("shiba-cni-test-{}", std::process::id()));
        let subnets = parse_subnets(["10.0.5.0/24"]).unwrap();
        write_cni_config(&dir, &subnets).unwrap();

        let contents = std::fs::read_to_string(dir.join(CNI_CONFIG_FILENAME)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["name"], NETWORK_NAME);
        assert_eq!(value["plugins"][0]["ipam"]["ranges"][0][0]["subnet"], "10.0.5.0/24");
        assert_eq!(value["plugins"][0]["ipam"]["routes"], json!([{ "dst": "0.0.0.0/0" }]));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn emits_default_route_per_family_present() {
        let dir = std::env::temp_dir().join(format!("shiba-cni-test3-{}", std::process::id()));
        let subnets = parse_subnets(["10.0.5.0/24", "fd00::/80"]).unwrap();
        write_cni_config(&dir, &subnets).unwrap();

        let contents = std::fs::read_to_string(dir.join(CNI_CONFIG_FILENAME)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        let routes = value["plugins"][0]["ipam"]["routes"].as_array().unwrap();
        assert_eq!(routes.len(), 2);
        let ranges = value["plugins"][0]["ipam"]["ranges"].as_array().unwrap();
        assert_eq!(ranges.len(), 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn warns_about_but_does_not_delete_colliding_config() {
        let dir = std::env::temp_dir().join(format!("shiba-cni-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("05-other.conf"), "{}").unwrap();

        let subnets = parse_subnets(["10.0.5.0/24"]).unwrap();
        write_cni_config(&dir, &subnets).unwrap();

        assert!(dir.join("05-other.conf").exists());
        assert!(dir.join(CNI_CONFIG_FILENAME).exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
