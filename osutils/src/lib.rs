pub mod dependencies;
pub mod envfile;
pub mod files;
pub mod fsck;
pub mod lsblk;
pub mod mount;
pub mod mountpoint;
