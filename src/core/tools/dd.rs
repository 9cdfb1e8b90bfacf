use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::ToolCommand;
use crate::config::ToolPaths;

// GNU: "1234567168 bytes (1.2 GB, 1.1 GiB) copied, 5.1 s, 242 MB/s"
// BSD/busybox: "1234567168 bytes transferred in 5.1 secs"
static BYTES_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s+bytes\b.*\b(copied|transferred)\b").expect("dd status regex")
});

/// `dd` writing `image` onto `device` with status reporting and a final fsync.
pub fn write_image(tools: &ToolPaths, image: &Path, device: &Path, block_size: &str) -> ToolCommand {
    let mut if_arg = std::ffi::OsString::from("if=");
    if_arg.push(image);
    let mut of_arg = std::ffi::OsString::from("of=");
    of_arg.push(device);

    ToolCommand::new(&tools.dd)
        .arg(if_arg)
        .arg(of_arg)
        .arg(format!("bs={}", block_size))
        .arg("conv=fsync")
        .arg("status=progress")
}

/// Flush kernel buffers after a raw write.
pub fn sync(tools: &ToolPaths) -> ToolCommand {
    ToolCommand::new(&tools.sync)
}

/// Byte count from a dd status line, if it is one.
pub fn parse_bytes_copied(line: &str) -> Option<u64> {
    BYTES_LINE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
