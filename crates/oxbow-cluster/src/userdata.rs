//! Worker userdata
//!
//! Each VM boots with a cloud-config that fetches the bootstrap image,
//! assembles the data volumes (RAID0 when sliced), and chain-loads the
//! skiff agent. Cluster-level cloud-config fragments are appended verbatim;
//! their contents are opaque here.

use crate::ec2::EbsLayout;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Inputs for one worker's cloud-config.
#[derive(Debug, Clone)]
pub struct UserdataSpec {
    pub bootstrap_image: String,
    /// Seconds the bootstrap waits for the agent image before giving up.
    pub bootstrap_expiry_secs: u64,
    /// Disables the idle-on-billing-boundary self-termination.
    pub immortal: bool,
    pub ssh_keys: Vec<String>,
    pub ebs: EbsLayout,
    /// Extra cloud-config merged in from cluster configuration.
    pub extra_cloud_config: Option<String>,
}

/// Render the cloud-config and encode it the way the launch API expects.
pub fn encoded_cloud_config(spec: &UserdataSpec) -> String {
    BASE64.encode(cloud_config(spec))
}

fn cloud_config(spec: &UserdataSpec) -> String {
    let mut out = String::from("#cloud-config\n");

    if !spec.ssh_keys.is_empty() {
        out.push_str("ssh_authorized_keys:\n");
        for key in &spec.ssh_keys {
            out.push_str(&format!("  - {key}\n"));
        }
    }

    // Data volume layout. One slice mounts directly; multiple slices are
    // striped into a RAID0 array for throughput.
    out.push_str("bootcmd:\n");
    if spec.ebs.slices > 1 {
        let devices: Vec<String> = (0..spec.ebs.slices)
            .map(|i| format!("/dev/xvd{}", (b'b' + i as u8) as char))
            .collect();
        out.push_str(&format!(
            "  - mdadm --create /dev/md0 --level=0 --raid-devices={} {}\n",
            spec.ebs.slices,
            devices.join(" ")
        ));
        out.push_str("  - mkfs.ext4 -F /dev/md0\n");
        out.push_str("  - mount /dev/md0 /mnt/data\n");
    } else {
        out.push_str("  - mkfs.ext4 -F /dev/xvdb\n");
        out.push_str("  - mount /dev/xvdb /mnt/data\n");
    }

    out.push_str("runcmd:\n");
    out.push_str(&format!(
        "  - curl --fail --retry 5 -o /usr/local/bin/skiff-bootstrap {}\n",
        spec.bootstrap_image
    ));
    out.push_str("  - chmod +x /usr/local/bin/skiff-bootstrap\n");
    let mut flags = format!("-expiry {}s", spec.bootstrap_expiry_secs);
    if spec.immortal {
        flags.push_str(" -immortal");
    }
    out.push_str(&format!("  - /usr/local/bin/skiff-bootstrap {flags}\n"));

    if let Some(extra) = &spec.extra_cloud_config {
        out.push_str(extra);
        if !extra.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(slices: u64) -> UserdataSpec {
        UserdataSpec {
            bootstrap_image: "https://artifacts.example.com/skiff/bootstrap".into(),
            bootstrap_expiry_secs: 600,
            immortal: false,
            ssh_keys: vec!["ssh-ed25519 AAAA user@host".into()],
            ebs: EbsLayout { volume_type: "gp3".into(), size_gib: 500, slices },
            extra_cloud_config: None,
        }
    }

    #[test]
    fn single_slice_mounts_directly() {
        let config = cloud_config(&spec(1));
        assert!(config.starts_with("#cloud-config\n"));
        assert!(config.contains("mount /dev/xvdb /mnt/data"));
        assert!(!config.contains("mdadm"));
        assert!(config.contains("ssh-ed25519"));
    }

    #[test]
    fn slices_form_raid0() {
        let config = cloud_config(&spec(3));
        assert!(config.contains("mdadm --create /dev/md0 --level=0 --raid-devices=3"));
        assert!(config.contains("/dev/xvdb /dev/xvdc /dev/xvdd"));
    }

    #[test]
    fn immortal_and_extra_config() {
        let mut s = spec(1);
        s.immortal = true;
        s.extra_cloud_config = Some("packages:\n  - htop".into());
        let config = cloud_config(&s);
        assert!(config.contains("-immortal"));
        assert!(config.ends_with("packages:\n  - htop\n"));
    }

    #[test]
    fn encoding_round_trips() {
        let encoded = encoded_cloud_config(&spec(1));
        let decoded = BASE64.decode(encoded).unwrap();
        assert!(String::from_utf8(decoded).unwrap().starts_with("#cloud-config"));
    }
}
