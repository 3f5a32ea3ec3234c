//! Mount, format, and resize helpers for the node service.
//!
//! Uses standard Linux tools: blkid, mkfs.ext4/mkfs.xfs, mount, umount,
//! findmnt, xfs_growfs, resize2fs.

use std::fs;
use std::process::Command;

use tonic::Status;
use tracing::{debug, error, info, warn};

pub type PlatformResult<T> = Result<T, Status>;

/// Default filesystem when the volume capability names none.
pub const DEFAULT_FS_TYPE: &str = "xfs";

/// Validate and normalize a requested filesystem type.
pub fn validate_fs_type(fs_type: &str) -> PlatformResult<&'static str> {
    match fs_type.to_lowercase().as_str() {
        "xfs" | "" => Ok("xfs"),
        "ext4" => Ok("ext4"),
        _ => Err(Status::invalid_argument(format!(
            "Unsupported filesystem type: {}. Supported: xfs, ext4",
            fs_type
        ))),
    }
}

/// Check if a path is currently mounted.
pub fn is_mounted(target: &str) -> PlatformResult<bool> {
    if let Ok(mounts) = fs::read_to_string("/proc/mounts") {
        return Ok(mounts
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(target)));
    }

    // Fallback to mount command
    let output = Command::new("mount").output().map_err(|e| {
        error!(error = %e, "Failed to execute mount");
        Status::internal(format!("Failed to check mounts: {}", e))
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().any(|line| line.contains(target)))
}

/// Check if a device needs formatting (has no valid filesystem).
pub fn needs_formatting(device: &str) -> PlatformResult<bool> {
    let output = Command::new("blkid")
        .args(["-p", device])
        .output()
        .map_err(|e| {
            error!(error = %e, "Failed to execute blkid");
            Status::internal(format!("Failed to check device filesystem: {}", e))
        })?;

    // blkid returns non-zero if no filesystem found
    if !output.status.success() {
        return Ok(true);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(!stdout.contains("TYPE="))
}

/// Format a device with the specified filesystem type.
pub fn format_device(device: &str, fs_type: &str) -> PlatformResult<()> {
    info!(device = %device, fs_type = %fs_type, "Formatting device");

    let (cmd, args): (&str, &[&str]) = match fs_type.to_lowercase().as_str() {
        "ext4" => ("mkfs.ext4", &["-F", device]),
        "xfs" => ("mkfs.xfs", &["-f", device]),
        _ => {
            return Err(Status::invalid_argument(format!(
                "Unsupported filesystem type: {}. Supported: xfs, ext4",
                fs_type
            )));
        }
    };

    let output = Command::new(cmd).args(args).output().map_err(|e| {
        error!(error = %e, "Failed to execute {cmd}");
        Status::internal(format!("Failed to execute {cmd}: {e}"))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, "{cmd} failed");
        return Err(Status::internal(format!("{cmd} failed: {stderr}")));
    }

    Ok(())
}

/// Mount a device to a target path.
pub fn mount_device(device: &str, target: &str, fs_type: &str) -> PlatformResult<()> {
    info!(device = %device, target = %target, fs_type = %fs_type, "Mounting device");

    fs::create_dir_all(target).map_err(|e| {
        error!(error = %e, "Failed to create mount target directory");
        Status::internal(format!("Failed to create mount directory: {}", e))
    })?;

    let fs_type_lower = fs_type.to_lowercase();
    let output = Command::new("mount")
        .args(["-t", &fs_type_lower, device, target])
        .output()
        .map_err(|e| {
            error!(error = %e, "Failed to execute mount");
            Status::internal(format!("Failed to execute mount: {}", e))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, "mount failed");
        return Err(Status::internal(format!("mount failed: {}", stderr)));
    }

    Ok(())
}

/// Create a bind mount.
pub fn bind_mount(source: &str, target: &str) -> PlatformResult<()> {
    info!(source = %source, target = %target, "Creating bind mount");

    fs::create_dir_all(target).map_err(|e| {
        error!(error = %e, "Failed to create bind mount target directory");
        Status::internal(format!(
            "Failed to create bind mount target directory: {}",
            e
        ))
    })?;

    let output = Command::new("mount")
        .args(["--bind", source, target])
        .output()
        .map_err(|e| {
            error!(error = %e, "Failed to execute mount --bind");
            Status::internal(format!("Failed to execute bind mount: {}", e))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, "bind mount failed");
        return Err(Status::internal(format!("bind mount failed: {}", stderr)));
    }

    Ok(())
}

/// Unmount a path. Unmounting a path that is not mounted is not an error.
pub fn unmount(target: &str) -> PlatformResult<()> {
    info!(target = %target, "Unmounting");

    if !is_mounted(target)? {
        debug!(target = %target, "Path is not mounted, skipping unmount");
        return Ok(());
    }

    let output = Command::new("umount").arg(target).output().map_err(|e| {
        error!(error = %e, "Failed to execute umount");
        Status::internal(format!("Failed to execute umount: {}", e))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not mounted") || stderr.contains("no mount point") {
            warn!(target = %target, "Path was not mounted");
            return Ok(());
        }
        error!(stderr = %stderr, "umount failed");
        return Err(Status::internal(format!("umount failed: {}", stderr)));
    }

    Ok(())
}

/// Resolve the backing device and filesystem type of a mounted path.
pub fn device_for_mount(path: &str) -> PlatformResult<(String, String)> {
    let output = Command::new("findmnt")
        .args(["-n", "-o", "SOURCE,FSTYPE", "--target", path])
        .output()
        .map_err(|e| {
            error!(error = %e, "Failed to execute findmnt");
            Status::internal(format!("Failed to execute findmnt: {}", e))
        })?;

    if !output.status.success() {
        return Err(Status::internal(format!(
            "No mount found at {}: {}",
            path,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut fields = stdout.split_whitespace();
    match (fields.next(), fields.next()) {
        (Some(device), Some(fs_type)) => Ok((device.to_string(), fs_type.to_string())),
        _ => Err(Status::internal(format!(
            "Could not parse findmnt output for {}: {}",
            path,
            stdout.trim()
        ))),
    }
}

/// Ask the kernel to re-read a SCSI device's capacity after an array-side
/// resize. Best effort; the filesystem grow step reports the real failure.
pub fn rescan_device(device: &str) {
    let dev_name = device.rsplit('/').next().unwrap_or(device);
    let rescan_path = format!("/sys/block/{}/device/rescan", dev_name);
    match fs::write(&rescan_path, "1") {
        Ok(()) => debug!(device = %device, "Requested SCSI rescan"),
        Err(e) => warn!(device = %device, error = %e, "SCSI rescan request failed"),
    }
}

/// Grow a mounted filesystem to fill its backing device.
pub fn grow_filesystem(device: &str, mount_path: &str, fs_type: &str) -> PlatformResult<()> {
    info!(device = %device, mount_path = %mount_path, fs_type = %fs_type, "Growing filesystem");

    let (cmd, arg) = match fs_type.to_lowercase().as_str() {
        // xfs_growfs takes the mount point, resize2fs the device
        "xfs" => ("xfs_growfs", mount_path),
        "ext4" | "ext3" | "ext2" => ("resize2fs", device),
        _ => {
            return Err(Status::invalid_argument(format!(
                "Cannot grow filesystem of type: {}",
                fs_type
            )));
        }
    };

    let output = Command::new(cmd).arg(arg).output().map_err(|e| {
        error!(error = %e, "Failed to execute {cmd}");
        Status::internal(format!("Failed to execute {cmd}: {e}"))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(stderr = %stderr, "{cmd} failed");
        return Err(Status::internal(format!("{cmd} failed: {stderr}")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_fs_type_valid() {
        assert_eq!(validate_fs_type("xfs").unwrap(), "xfs");
        assert_eq!(validate_fs_type("ext4").unwrap(), "ext4");
        assert_eq!(validate_fs_type("").unwrap(), "xfs");
        assert_eq!(validate_fs_type("XFS").unwrap(), "xfs");
    }

    #[test]
    fn test_validate_fs_type_invalid() {
        assert!(validate_fs_type("ntfs").is_err());
        assert!(validate_fs_type("zfs").is_err());
        assert!(validate_fs_type("btrfs").is_err());
    }

    #[test]
    fn test_is_mounted_unmounted_path() {
        // /proc/mounts never lists this path
        assert!(!is_mounted("/nonexistent/definitely/not/mounted").unwrap());
    }
}
