//! cloud-init user-data image construction.
//!
//! Each VM boots with a ~10 MiB FAT volume labelled `CIDATA` carrying three
//! files at its root: `meta-data`, `user-data`, and `network-config` — the
//! cloud-init NoCloud contract. The network config binds the guest NIC by
//! MAC and pins the `/30` addressing; the user-data comes in two flavours:
//!
//! - **worker**: installs the generated SSH key for user `ubuntu` and walls
//!   the guest off with UFW, allowing TCP/22 from the gateway only.
//! - **prebuild**: installs baseline packages, runs the operator-supplied
//!   extra commands verbatim, then scrubs cloud-init state and powers the
//!   guest off, leaving a customized base image behind.

use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

use askama::Template;

use crate::error::{ImageError, Result};

/// Size of the generated user-data image.
const USERDATA_IMAGE_BYTES: u64 = 10 * 1024 * 1024;

/// FAT volume label cloud-init looks for (padded to 11 bytes).
const CIDATA_LABEL: [u8; 11] = *b"CIDATA     ";

/// Everything needed to render one instance's seed volume.
#[derive(Debug)]
pub struct UserDataSpec<'a> {
    /// Instance (and hostname) name.
    pub instance_name: &'a str,
    /// Guest MAC address, used to match the NIC in the network config.
    pub mac_address: &'a str,
    /// Guest-side TAP address.
    pub guest_ip: Ipv4Addr,
    /// Host-side TAP address, the guest's default gateway.
    pub gateway: Ipv4Addr,
    /// CIDR suffix of the per-instance subnet, e.g. `"/30"`.
    pub netmask: &'a str,
    /// Worker or prebuild payload.
    pub mode: UserDataMode<'a>,
}

/// The two user-data flavours.
#[derive(Debug)]
pub enum UserDataMode<'a> {
    /// SSH-reachable pool member.
    Worker {
        /// OpenSSH `authorized_keys` line for user `ubuntu`.
        ssh_authorized_key: &'a str,
    },
    /// Base-image customization run.
    Prebuild {
        /// Shell snippets appended verbatim to `runcmd`.
        extra_commands: &'a [String],
    },
}

/// The three rendered seed files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDataParts {
    pub meta_data: String,
    pub user_data: String,
    pub network_config: String,
}

#[derive(Template)]
#[template(path = "meta-data", escape = "none")]
struct MetaDataTemplate<'a> {
    instance_name: &'a str,
}

#[derive(Template)]
#[template(path = "network-config", escape = "none")]
struct NetworkConfigTemplate<'a> {
    mac_address: &'a str,
    guest_ip: Ipv4Addr,
    gateway: Ipv4Addr,
    netmask: &'a str,
}

#[derive(Template)]
#[template(path = "user-data", escape = "none")]
struct WorkerUserDataTemplate<'a> {
    instance_name: &'a str,
    gateway: Ipv4Addr,
    ssh_authorized_key: &'a str,
}

#[derive(Template)]
#[template(path = "user-data-prebuild", escape = "none")]
struct PrebuildUserDataTemplate<'a> {
    instance_name: &'a str,
    extra_commands: &'a [String],
}

/// Renders the three seed files without touching the filesystem.
///
/// # Errors
///
/// Returns an error if template rendering fails.
pub fn render_parts(spec: &UserDataSpec<'_>) -> Result<UserDataParts> {
    let render_err = |e: askama::Error| ImageError::UserData(e.to_string());

    let meta_data = MetaDataTemplate {
        instance_name: spec.instance_name,
    }
    .render()
    .map_err(render_err)?;

    let network_config = NetworkConfigTemplate {
        mac_address: spec.mac_address,
        guest_ip: spec.guest_ip,
        gateway: spec.gateway,
        netmask: spec.netmask,
    }
    .render()
    .map_err(render_err)?;

    let user_data = match spec.mode {
        UserDataMode::Worker { ssh_authorized_key } => WorkerUserDataTemplate {
            instance_name: spec.instance_name,
            gateway: spec.gateway,
            ssh_authorized_key,
        }
        .render()
        .map_err(render_err)?,
        UserDataMode::Prebuild { extra_commands } => PrebuildUserDataTemplate {
            instance_name: spec.instance_name,
            extra_commands,
        }
        .render()
        .map_err(render_err)?,
    };

    Ok(UserDataParts {
        meta_data,
        user_data,
        network_config,
    })
}

/// Builds the CIDATA image at `target`.
///
/// # Errors
///
/// Returns an error if rendering, formatting, or writing fails.
pub fn write(spec: &UserDataSpec<'_>, target: &Path) -> Result<()> {
    let parts = render_parts(spec)?;

    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(target)?;
    file.set_len(USERDATA_IMAGE_BYTES)?;

    fatfs::format_volume(
        &mut file,
        fatfs::FormatVolumeOptions::new().volume_label(CIDATA_LABEL),
    )?;

    let fs = fatfs::FileSystem::new(file, fatfs::FsOptions::new())?;
    {
        let root = fs.root_dir();
        for (name, contents) in [
            ("meta-data", &parts.meta_data),
            ("user-data", &parts.user_data),
            ("network-config", &parts.network_config),
        ] {
            let mut f = root.create_file(name)?;
            f.write_all(contents.as_bytes())?;
        }
    }
    fs.unmount()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn worker_spec<'a>(key: &'a str) -> UserDataSpec<'a> {
        UserDataSpec {
            instance_name: "pool0",
            mac_address: "de:51:aa:bb:cc:dd",
            guest_ip: Ipv4Addr::new(10, 0, 0, 2),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            netmask: "/30",
            mode: UserDataMode::Worker {
                ssh_authorized_key: key,
            },
        }
    }

    #[test]
    fn worker_user_data_authorizes_key_and_walls_off_ssh() {
        let parts = render_parts(&worker_spec("ssh-ed25519 AAAA test")).unwrap();

        assert!(parts.user_data.starts_with("#cloud-config"));
        assert!(parts.user_data.contains("- ssh-ed25519 AAAA test"));
        assert!(parts
            .user_data
            .contains("ufw allow proto tcp from 10.0.0.1 to any port 22"));
        assert!(parts.user_data.contains("ufw --force enable"));
        assert!(!parts.user_data.contains("shutdown"));
    }

    #[test]
    fn prebuild_user_data_appends_commands_in_order() {
        let cmds = vec!["echo one".to_string(), "echo two".to_string()];
        let spec = UserDataSpec {
            mode: UserDataMode::Prebuild {
                extra_commands: &cmds,
            },
            ..worker_spec("")
        };
        let parts = render_parts(&spec).unwrap();

        let one = parts.user_data.find("- echo one").unwrap();
        let two = parts.user_data.find("- echo two").unwrap();
        let clean = parts.user_data.find("- cloud-init clean").unwrap();
        let off = parts.user_data.find("- shutdown -h now").unwrap();
        assert!(one < two && two < clean && clean < off);
    }

    #[test]
    fn prebuild_without_extra_commands_still_cleans_and_powers_off() {
        let spec = UserDataSpec {
            mode: UserDataMode::Prebuild { extra_commands: &[] },
            ..worker_spec("")
        };
        let parts = render_parts(&spec).unwrap();

        assert!(parts.user_data.contains("cloud-init clean --logs --machine-id --seed"));
        assert!(parts.user_data.contains("shutdown -h now"));
    }

    #[test]
    fn network_config_binds_by_mac_with_static_route() {
        let parts = render_parts(&worker_spec("k")).unwrap();

        assert!(parts
            .network_config
            .contains("macaddress: \"de:51:aa:bb:cc:dd\""));
        assert!(parts.network_config.contains("- 10.0.0.2/30"));
        assert!(parts.network_config.contains("via: 10.0.0.1"));
        assert!(parts.network_config.contains("[1.1.1.3, 1.0.0.3]"));
        assert!(parts.network_config.contains("mtu: 1500"));
    }

    #[test]
    fn meta_data_names_the_instance() {
        let parts = render_parts(&worker_spec("k")).unwrap();
        assert!(parts.meta_data.contains("instance-id: pool0"));
        assert!(parts.meta_data.contains("local-hostname: pool0"));
    }

    #[test]
    fn written_image_contains_all_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool0_userdata.img");
        let spec = worker_spec("ssh-ed25519 AAAA test");

        write(&spec, &path).unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            USERDATA_IMAGE_BYTES
        );

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let fs = fatfs::FileSystem::new(file, fatfs::FsOptions::new()).unwrap();
        assert_eq!(
            fs.volume_label().trim_end(),
            "CIDATA"
        );

        let expected = render_parts(&spec).unwrap();
        let root = fs.root_dir();
        for (name, contents) in [
            ("meta-data", &expected.meta_data),
            ("user-data", &expected.user_data),
            ("network-config", &expected.network_config),
        ] {
            let mut buf = String::new();
            root.open_file(name)
                .unwrap()
                .read_to_string(&mut buf)
                .unwrap();
            assert_eq!(&buf, contents, "{name} round-trips");
        }
    }
}
