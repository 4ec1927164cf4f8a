use std::collections::HashMap;
use std::fmt::{self, Display};
use std::process::{Command, Output};
use std::str::FromStr;

use tracing::{debug, info, instrument, warn};

use super::error::{CioError, Result};

/// Check command output for success or return appropriate error.
///
/// This helper reduces boilerplate for checking command results.
/// It handles common error patterns like "does not exist" and "already exists".
fn check_command_result(output: &Output, context: &str) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);

    // Map common error patterns to specific error types
    if stderr.contains("does not exist") || stderr.contains("not found") {
        return Err(CioError::VdiskNotFound(context.to_string()));
    }
    if stderr.contains("already exists") {
        return Err(CioError::VdiskExists(context.to_string()));
    }

    Err(CioError::CommandFailed(format!("{}: {}", context, stderr)))
}

/// Validate that an identifier is safe for use on a cio command line.
/// Only allows alphanumeric characters, underscores, hyphens, and periods.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(CioError::InvalidId("identifier cannot be empty".into()));
    }
    if id.contains("..") {
        return Err(CioError::InvalidId("path traversal not allowed".into()));
    }
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(CioError::InvalidId(format!(
            "invalid characters in '{}': only alphanumeric, underscore, hyphen, and period allowed",
            id
        )));
    }
    Ok(())
}

/// Validate a tag pair before it is placed on a command line. Keys use a
/// restricted charset plus ':' for namespacing; values must not collide with
/// the `key=value,key=value` listing syntax.
fn validate_tag_pair(key: &str, value: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CioError::InvalidTag("tag key cannot be empty".into()));
    }
    if !key
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == ':')
    {
        return Err(CioError::InvalidTag(format!("invalid tag key '{}'", key)));
    }
    if value.is_empty() || value.contains('=') || value.contains(',') || value.contains(char::is_whitespace) {
        return Err(CioError::InvalidTag(format!(
            "invalid tag value '{}' for key '{}'",
            value, key
        )));
    }
    Ok(())
}

/// Lifecycle state of a vdisk as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdiskStatus {
    Available,
    Attaching,
    Attached,
    Detaching,
    Failed,
}

impl VdiskStatus {
    /// True while the vdisk is associated with a node.
    pub fn in_use(self) -> bool {
        matches!(
            self,
            VdiskStatus::Attaching | VdiskStatus::Attached | VdiskStatus::Detaching
        )
    }
}

impl Display for VdiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VdiskStatus::Available => write!(f, "available"),
            VdiskStatus::Attaching => write!(f, "attaching"),
            VdiskStatus::Attached => write!(f, "attached"),
            VdiskStatus::Detaching => write!(f, "detaching"),
            VdiskStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for VdiskStatus {
    type Err = CioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "available" => Ok(VdiskStatus::Available),
            "attaching" => Ok(VdiskStatus::Attaching),
            "attached" => Ok(VdiskStatus::Attached),
            "detaching" => Ok(VdiskStatus::Detaching),
            "failed" => Ok(VdiskStatus::Failed),
            other => Err(CioError::ParseError(format!(
                "unknown vdisk status '{}'",
                other
            ))),
        }
    }
}

/// Storage tier a vdisk is provisioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageTier {
    #[default]
    Ssd,
    Hdd,
    Nvme,
}

impl Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageTier::Ssd => write!(f, "ssd"),
            StorageTier::Hdd => write!(f, "hdd"),
            StorageTier::Nvme => write!(f, "nvme"),
        }
    }
}

impl FromStr for StorageTier {
    type Err = StorageTierParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ssd" => Ok(StorageTier::Ssd),
            "hdd" => Ok(StorageTier::Hdd),
            "nvme" => Ok(StorageTier::Nvme),
            _ => Err(StorageTierParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid storage tier.
#[derive(Debug, Clone)]
pub struct StorageTierParseError(String);

impl Display for StorageTierParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown storage tier '{}': expected 'ssd', 'hdd', or 'nvme'",
            self.0
        )
    }
}

impl std::error::Error for StorageTierParseError {}

/// Provisioning parameters passed to `cio vdadd`.
#[derive(Debug, Clone)]
pub struct VdiskProfile {
    /// Replica count for the vdisk
    pub redundancy: u32,
    /// Backing storage tier
    pub tier: StorageTier,
    /// Minimum provisioned IOPS
    pub min_iops: u32,
    /// Maximum provisioned IOPS
    pub max_iops: u32,
}

impl Default for VdiskProfile {
    fn default() -> Self {
        Self {
            redundancy: 2,
            tier: StorageTier::Ssd,
            min_iops: 1000,
            max_iops: 2000,
        }
    }
}

/// Represents a vdisk as reported by `cio vdlist` / `cio vdinfo`
#[derive(Debug, Clone)]
pub struct Vdisk {
    /// Backend vdisk identifier (e.g., "vd12")
    pub id: String,
    /// Provisioned size in bytes
    pub size_bytes: u64,
    /// Current lifecycle state
    pub status: VdiskStatus,
    /// Node the vdisk is attached to, if any
    pub attached_to: Option<String>,
    /// Device node on the attached host, if any
    pub device: Option<String>,
    /// Sidecar tags (key=value metadata)
    pub tags: HashMap<String, String>,
}

/// Manager for vdisk operations through the external cio tool
pub struct CioManager {
    /// Path to the cio binary
    cio_path: String,
}

impl CioManager {
    /// Create a new CioManager, verifying the tool is present and responsive
    pub fn new(cio_path: impl Into<String>) -> Result<Self> {
        let cio_path = cio_path.into();
        info!(tool = %cio_path, "Initializing CIO manager");

        if cio_path.is_empty() {
            return Err(CioError::InvalidId("cio path cannot be empty".to_string()));
        }

        // Probe the backend with a cheap listing call
        let output = Command::new(&cio_path).args(["vdlist", "-H", "-p"]).output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CioError::CommandFailed(format!(
                "cio tool probe failed: {}",
                stderr
            )));
        }

        info!(tool = %cio_path, "CIO manager initialized successfully");
        Ok(Self { cio_path })
    }

    fn command(&self) -> Command {
        Command::new(&self.cio_path)
    }

    /// Create a new vdisk and return its backend id
    #[instrument(skip(self, profile))]
    pub fn create_vdisk(&self, size_gib: u64, profile: &VdiskProfile) -> Result<String> {
        info!(
            size_gib,
            redundancy = profile.redundancy,
            tier = %profile.tier,
            "Creating vdisk"
        );

        let output = self
            .command()
            .args([
                "vdadd",
                "-c",
                &size_gib.to_string(),
                "-l",
                &profile.redundancy.to_string(),
                "-t",
                &profile.tier.to_string(),
                "-i",
                &profile.min_iops.to_string(),
                &profile.max_iops.to_string(),
            ])
            .output()?;

        if let Err(e) = check_command_result(&output, "vdadd") {
            warn!(error = %e, "Failed to create vdisk");
            return Err(e);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = parse_created_id(&stdout)?;

        info!(vdisk = %id, size_gib, "Vdisk created successfully");
        Ok(id)
    }

    /// Look up a single vdisk by id
    pub fn get_vdisk(&self, id: &str) -> Result<Vdisk> {
        validate_id(id)?;

        let output = self.command().args(["vdinfo", "-H", "-p", id]).output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("does not exist") || stderr.contains("not found") {
                return Err(CioError::VdiskNotFound(id.to_string()));
            }
            return Err(CioError::CommandFailed(stderr.to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .next()
            .ok_or_else(|| CioError::ParseError("empty output from vdinfo".to_string()))?;

        parse_vdisk_line(line)
    }

    /// List all vdisks known to the backend
    pub fn list_vdisks(&self) -> Result<Vec<Vdisk>> {
        debug!("Listing vdisks");

        let output = self.command().args(["vdlist", "-H", "-p"]).output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(error = %stderr, "Failed to list vdisks");
            return Err(CioError::CommandFailed(stderr.to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut vdisks = Vec::new();

        for line in stdout.lines() {
            if line.trim().is_empty() {
                continue;
            }
            vdisks.push(parse_vdisk_line(line)?);
        }

        debug!(count = vdisks.len(), "Found vdisks");
        Ok(vdisks)
    }

    /// Begin attaching a vdisk to a node.
    ///
    /// The backend completes the attach asynchronously; callers observe
    /// completion by polling `get_vdisk`.
    #[instrument(skip(self))]
    pub fn attach_vdisk(&self, id: &str, node: &str) -> Result<()> {
        validate_id(id)?;
        validate_id(node)?;

        info!(vdisk = %id, node = %node, "Attaching vdisk");

        let output = self.command().args(["vdattach", id, "-n", node]).output()?;

        if let Err(e) = check_command_result(&output, id) {
            warn!(vdisk = %id, error = %e, "Failed to attach vdisk");
            return Err(e);
        }

        Ok(())
    }

    /// Begin detaching a vdisk from its current node
    #[instrument(skip(self))]
    pub fn detach_vdisk(&self, id: &str) -> Result<()> {
        validate_id(id)?;

        info!(vdisk = %id, "Detaching vdisk");

        let output = self.command().args(["vddetach", id]).output()?;

        if let Err(e) = check_command_result(&output, id) {
            warn!(vdisk = %id, error = %e, "Failed to detach vdisk");
            return Err(e);
        }

        Ok(())
    }

    /// Destroy a vdisk.
    ///
    /// This operation is idempotent: a retried destroy that finds the vdisk
    /// already gone returns Ok.
    #[instrument(skip(self))]
    pub fn destroy_vdisk(&self, id: &str) -> Result<()> {
        validate_id(id)?;

        info!(vdisk = %id, "Destroying vdisk");

        let output = self.command().args(["vddel", id]).output()?;

        match check_command_result(&output, id) {
            Err(CioError::VdiskNotFound(_)) => {
                info!(vdisk = %id, "Vdisk already destroyed (idempotent)");
                Ok(())
            }
            Err(e) => {
                warn!(vdisk = %id, error = %e, "Failed to destroy vdisk");
                Err(e)
            }
            Ok(()) => {
                info!(vdisk = %id, "Vdisk destroyed successfully");
                Ok(())
            }
        }
    }

    /// Set sidecar tags on a vdisk
    #[instrument(skip(self, pairs))]
    pub fn set_tags(&self, id: &str, pairs: &[(String, String)]) -> Result<()> {
        validate_id(id)?;

        let mut cmd = self.command();
        cmd.args(["vdmod", id]);
        for (key, value) in pairs {
            validate_tag_pair(key, value)?;
            cmd.arg("--tag").arg(format!("{}={}", key, value));
        }

        debug!(vdisk = %id, count = pairs.len(), "Setting vdisk tags");

        let output = cmd.output()?;

        if let Err(e) = check_command_result(&output, id) {
            warn!(vdisk = %id, error = %e, "Failed to set vdisk tags");
            return Err(e);
        }

        Ok(())
    }
}

/// Parse the id out of `vdadd` output (first line: "vdisk <id> created")
fn parse_created_id(stdout: &str) -> Result<String> {
    let line = stdout
        .lines()
        .next()
        .ok_or_else(|| CioError::ParseError("empty output from vdadd".to_string()))?;

    let mut words = line.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("vdisk"), Some(id), Some("created")) => {
            validate_id(id)?;
            Ok(id.to_string())
        }
        _ => Err(CioError::ParseError(format!(
            "unrecognized vdadd output: {}",
            line
        ))),
    }
}

/// Parse a line of cio output into a Vdisk
/// (expects: id, size_bytes, status, node, device, tags)
fn parse_vdisk_line(line: &str) -> Result<Vdisk> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 6 {
        return Err(CioError::ParseError(format!(
            "expected 6 fields, got {}: {}",
            fields.len(),
            line
        )));
    }

    let id = fields[0].to_string();
    let size_bytes = parse_size(fields[1])?;
    let status = fields[2].parse::<VdiskStatus>()?;
    let attached_to = opt_field(fields[3]);
    let device = opt_field(fields[4]);
    let tags = parse_tags(fields[5])?;

    Ok(Vdisk {
        id,
        size_bytes,
        status,
        attached_to,
        device,
        tags,
    })
}

/// Parse a size string into bytes.
/// With -p flag, cio outputs bytes directly as integers.
fn parse_size(size_str: &str) -> Result<u64> {
    let size_str = size_str.trim();
    if size_str == "-" {
        return Ok(0);
    }

    size_str
        .parse::<u64>()
        .map_err(|_| CioError::ParseError(format!("invalid size value: {}", size_str)))
}

/// Unset columns are printed as "-"
fn opt_field(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() || s == "-" {
        None
    } else {
        Some(s.to_string())
    }
}

/// Parse the tags column ("key=value,key=value" or "-")
fn parse_tags(s: &str) -> Result<HashMap<String, String>> {
    let mut tags = HashMap::new();
    let s = s.trim();
    if s.is_empty() || s == "-" {
        return Ok(tags);
    }

    for pair in s.split(',') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| CioError::ParseError(format!("malformed tag pair: {}", pair)))?;
        tags.insert(key.to_string(), value.to_string());
    }

    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        // With -p flag, cio outputs bytes directly
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("8589934592").unwrap(), 8 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("-").unwrap(), 0);
        // Invalid input should error
        assert!(parse_size("8G").is_err());
        assert!(parse_size("invalid").is_err());
    }

    #[test]
    fn test_validate_id() {
        // Valid ids
        assert!(validate_id("vd1").is_ok());
        assert!(validate_id("vd-1").is_ok());
        assert!(validate_id("vd_1").is_ok());
        assert!(validate_id("node.internal").is_ok());
        assert!(validate_id("i-0abc123def").is_ok());

        // Invalid ids
        assert!(validate_id("").is_err());
        assert!(validate_id("vd/1").is_err());
        assert!(validate_id("vd 1").is_err());
        assert!(validate_id("vd;rm -rf /").is_err());
        assert!(validate_id("$(whoami)").is_err());
        // Path traversal
        assert!(validate_id("..").is_err());
        assert!(validate_id("vd..1").is_err());
        assert!(validate_id("../../../etc/passwd").is_err());
    }

    #[test]
    fn test_validate_tag_pair() {
        assert!(validate_tag_pair("cio:dataset-id", "abc-123").is_ok());
        assert!(validate_tag_pair("", "x").is_err());
        assert!(validate_tag_pair("key", "").is_err());
        assert!(validate_tag_pair("key", "a=b").is_err());
        assert!(validate_tag_pair("key", "a,b").is_err());
        assert!(validate_tag_pair("key", "a b").is_err());
        assert!(validate_tag_pair("bad key", "x").is_err());
    }

    #[test]
    fn test_vdisk_status_from_str() {
        assert_eq!("available".parse::<VdiskStatus>().unwrap(), VdiskStatus::Available);
        assert_eq!("Attached".parse::<VdiskStatus>().unwrap(), VdiskStatus::Attached);
        assert_eq!("ATTACHING".parse::<VdiskStatus>().unwrap(), VdiskStatus::Attaching);
        assert_eq!("detaching".parse::<VdiskStatus>().unwrap(), VdiskStatus::Detaching);
        assert_eq!("failed".parse::<VdiskStatus>().unwrap(), VdiskStatus::Failed);
        assert!("online".parse::<VdiskStatus>().is_err());
    }

    #[test]
    fn test_vdisk_status_in_use() {
        assert!(!VdiskStatus::Available.in_use());
        assert!(VdiskStatus::Attaching.in_use());
        assert!(VdiskStatus::Attached.in_use());
        assert!(VdiskStatus::Detaching.in_use());
        assert!(!VdiskStatus::Failed.in_use());
    }

    #[test]
    fn test_storage_tier_round_trip() {
        assert_eq!("ssd".parse::<StorageTier>().unwrap(), StorageTier::Ssd);
        assert_eq!("HDD".parse::<StorageTier>().unwrap(), StorageTier::Hdd);
        assert_eq!("NvMe".parse::<StorageTier>().unwrap(), StorageTier::Nvme);
        assert!("tape".parse::<StorageTier>().is_err());
        assert_eq!(StorageTier::Ssd.to_string(), "ssd");
        assert_eq!(StorageTier::Nvme.to_string(), "nvme");
    }

    #[test]
    fn test_vdisk_profile_default() {
        let profile = VdiskProfile::default();
        assert_eq!(profile.redundancy, 2);
        assert_eq!(profile.tier, StorageTier::Ssd);
        assert_eq!(profile.min_iops, 1000);
        assert_eq!(profile.max_iops, 2000);
    }

    #[test]
    fn test_parse_created_id() {
        assert_eq!(parse_created_id("vdisk vd12 created\n").unwrap(), "vd12");
        assert!(parse_created_id("").is_err());
        assert!(parse_created_id("something went wrong").is_err());
        // Id must still pass the charset check
        assert!(parse_created_id("vdisk vd;12 created").is_err());
    }

    #[test]
    fn test_parse_vdisk_line_detached() {
        let line = "vd7\t8589934592\tavailable\t-\t-\t-";
        let vdisk = parse_vdisk_line(line).unwrap();
        assert_eq!(vdisk.id, "vd7");
        assert_eq!(vdisk.size_bytes, 8 * 1024 * 1024 * 1024);
        assert_eq!(vdisk.status, VdiskStatus::Available);
        assert!(vdisk.attached_to.is_none());
        assert!(vdisk.device.is_none());
        assert!(vdisk.tags.is_empty());
    }

    #[test]
    fn test_parse_vdisk_line_attached_with_tags() {
        let line = "vd7\t8589934592\tattached\ti-0abc\t/dev/vdisk/vd7\tcio:cluster-id=b52188b1-bf39-4aaf-9e54-107d2ccf28ad,cio:metadata-version=1";
        let vdisk = parse_vdisk_line(line).unwrap();
        assert_eq!(vdisk.status, VdiskStatus::Attached);
        assert_eq!(vdisk.attached_to.as_deref(), Some("i-0abc"));
        assert_eq!(vdisk.device.as_deref(), Some("/dev/vdisk/vd7"));
        assert_eq!(
            vdisk.tags.get("cio:metadata-version").map(String::as_str),
            Some("1")
        );
        assert_eq!(vdisk.tags.len(), 2);
    }

    #[test]
    fn test_parse_vdisk_line_errors() {
        // Too few columns
        assert!(parse_vdisk_line("vd7\t123\tavailable").is_err());
        // Bad size
        assert!(parse_vdisk_line("vd7\t8G\tavailable\t-\t-\t-").is_err());
        // Bad status
        assert!(parse_vdisk_line("vd7\t123\tonline\t-\t-\t-").is_err());
        // Malformed tags
        assert!(parse_vdisk_line("vd7\t123\tavailable\t-\t-\tnot-a-pair").is_err());
    }

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags("a=1,b=2").unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.get("a").map(String::as_str), Some("1"));
        assert!(parse_tags("-").unwrap().is_empty());
        assert!(parse_tags("").unwrap().is_empty());
        assert!(parse_tags("oops").is_err());
    }
}
