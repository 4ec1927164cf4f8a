pub mod error;
pub mod tags;
pub mod vdisk;

pub use error::{CioError, Result};
pub use tags::{VolumeTags, is_cluster_volume};
pub use vdisk::{CioManager, StorageTier, Vdisk, VdiskProfile, VdiskStatus};
