use std::{fmt, path::Path};

use osutils::lsblk::{self, BlockDevice};

use crate::{
    constants::{
        BOOT_PARTITION_LABEL, ROOTFS_A_LABEL, ROOTFS_B_LABEL, WRITABLE_PARTITION_LABEL,
    },
    error::UpgradeError,
};

/// 1-character rootfs identifier, the final character of a root partition
/// label. Doubles as the per-slot directory name on the boot partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootfsTag(pub char);

impl RootfsTag {
    fn from_label(label: &str) -> Self {
        // Labels come from the recognised closed set, which is never empty.
        RootfsTag(label.chars().next_back().unwrap_or('?'))
    }
}

impl fmt::Display for RootfsTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The tag pair of a dual-root system. Always ({a},{b}) or ({b},{a}).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootfsTags {
    pub current: RootfsTag,
    pub other: RootfsTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Two root partitions; upgrades flip between them.
    Dual,
    /// One root partition; upgrade operations are no-ops.
    Single,
}

/// Role assignment over the recognised partitions of the running system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRoles {
    /// The root partition mounted at `/`.
    pub current: BlockDevice,

    /// The inactive sibling root. Absent on single-root systems.
    pub other: Option<BlockDevice>,

    /// Separate boot partition, if the image has one.
    pub boot: Option<BlockDevice>,

    /// The writable user-data partition.
    pub writable: Option<BlockDevice>,
}

/// All labels this tool recognises.
pub fn recognised_labels() -> [&'static str; 4] {
    [
        ROOTFS_A_LABEL,
        ROOTFS_B_LABEL,
        BOOT_PARTITION_LABEL,
        WRITABLE_PARTITION_LABEL,
    ]
}

fn is_root_label(label: &str) -> bool {
    label == ROOTFS_A_LABEL || label == ROOTFS_B_LABEL
}

impl PartitionRoles {
    /// Enumerates the system's labelled partitions and classifies them.
    pub fn discover() -> Result<Self, UpgradeError> {
        let devices = lsblk::probe(&recognised_labels()).map_err(UpgradeError::ProbeFailed)?;
        Self::classify(devices)
    }

    /// Classifies an enumerated device list into roles.
    ///
    /// Two root labels make a dual system and exactly one of the two must be
    /// mounted at `/`; one root label makes a single system; zero is not a
    /// layout this tool understands.
    pub fn classify(devices: Vec<BlockDevice>) -> Result<Self, UpgradeError> {
        let boot = devices
            .iter()
            .find(|d| d.label == BOOT_PARTITION_LABEL)
            .cloned();
        let writable = devices
            .iter()
            .find(|d| d.label == WRITABLE_PARTITION_LABEL)
            .cloned();

        let mut roots: Vec<BlockDevice> = devices
            .into_iter()
            .filter(|d| is_root_label(&d.label))
            .collect();

        match roots.len() {
            1 => Ok(PartitionRoles {
                current: roots.remove(0),
                other: None,
                boot,
                writable,
            }),
            2 => {
                let current_pos = roots
                    .iter()
                    .position(|d| d.mountpoint.as_deref() == Some(Path::new("/")))
                    .ok_or(UpgradeError::TopologyUnrecognised)?;
                let current = roots.remove(current_pos);
                let other = roots.remove(0);
                Ok(PartitionRoles {
                    current,
                    other: Some(other),
                    boot,
                    writable,
                })
            }
            _ => Err(UpgradeError::TopologyUnrecognised),
        }
    }

    pub fn topology(&self) -> Topology {
        if self.other.is_some() {
            Topology::Dual
        } else {
            Topology::Single
        }
    }

    pub fn is_dual(&self) -> bool {
        self.topology() == Topology::Dual
    }

    /// The (current, other) tag pair. None on single-root systems.
    pub fn tags(&self) -> Option<RootfsTags> {
        self.other.as_ref().map(|other| RootfsTags {
            current: RootfsTag::from_label(&self.current.label),
            other: RootfsTag::from_label(&other.label),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn device(label: &str, node: &str, mountpoint: Option<&str>) -> BlockDevice {
        BlockDevice {
            label: label.into(),
            device_path: format!("/dev/{node}").into(),
            parent_path: "/dev/sda".into(),
            mountpoint: mountpoint.map(Into::into),
        }
    }

    fn dual_devices() -> Vec<BlockDevice> {
        vec![
            device("system-boot", "sda1", Some("/boot/uboot")),
            device("system-a", "sda2", Some("/")),
            device("system-b", "sda3", None),
            device("writable", "sda4", Some("/writable")),
        ]
    }

    #[test]
    fn test_classify_dual() {
        let roles = PartitionRoles::classify(dual_devices()).unwrap();

        assert_eq!(roles.topology(), Topology::Dual);
        assert_eq!(roles.current.label, "system-a");
        assert_eq!(roles.other.as_ref().unwrap().label, "system-b");
        assert_eq!(roles.boot.as_ref().unwrap().label, "system-boot");
        assert_eq!(roles.writable.as_ref().unwrap().label, "writable");
    }

    #[test]
    fn test_classify_dual_booted_from_b() {
        let devices = vec![
            device("system-a", "sda2", None),
            device("system-b", "sda3", Some("/")),
        ];
        let roles = PartitionRoles::classify(devices).unwrap();

        assert_eq!(roles.current.label, "system-b");
        assert_eq!(roles.other.as_ref().unwrap().label, "system-a");

        let tags = roles.tags().unwrap();
        assert_eq!(tags.current.to_string(), "b");
        assert_eq!(tags.other.to_string(), "a");
    }

    #[test]
    fn test_classify_single() {
        let devices = vec![
            device("system-a", "sda2", Some("/")),
            device("writable", "sda3", Some("/writable")),
        ];
        let roles = PartitionRoles::classify(devices).unwrap();

        assert_eq!(roles.topology(), Topology::Single);
        assert!(roles.other.is_none());
        assert!(roles.tags().is_none());
    }

    #[test]
    fn test_classify_no_roots() {
        let devices = vec![device("writable", "sda3", Some("/writable"))];
        assert!(matches!(
            PartitionRoles::classify(devices),
            Err(UpgradeError::TopologyUnrecognised)
        ));
    }

    #[test]
    fn test_classify_dual_without_active_root() {
        // Two roots but neither mounted at / — not a layout we can reason
        // about.
        let devices = vec![
            device("system-a", "sda2", None),
            device("system-b", "sda3", None),
        ];
        assert!(matches!(
            PartitionRoles::classify(devices),
            Err(UpgradeError::TopologyUnrecognised)
        ));
    }

    #[test]
    fn test_tags_cover_both_slots() {
        let roles = PartitionRoles::classify(dual_devices()).unwrap();
        let tags = roles.tags().unwrap();
        let mut pair = [tags.current.to_string(), tags.other.to_string()];
        pair.sort();
        assert_eq!(pair, ["a", "b"]);
    }
}
