use std::path::Path;

use super::ToolCommand;
use crate::config::ToolPaths;
use crate::core::hardware::PartitionTable;

/// `parted -s <device> mklabel <gpt|msdos>`. `None` for an unknown table type.
pub fn mklabel(tools: &ToolPaths, device: &Path, table: PartitionTable) -> Option<ToolCommand> {
    let label = table.parted_label()?;
    Some(
        ToolCommand::new(&tools.parted)
            .arg("-s")
            .arg(device.as_os_str())
            .arg("mklabel")
            .arg(label),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbr_maps_to_msdos_label() {
        let cmd = mklabel(&ToolPaths::default(), Path::new("/dev/sdc"), PartitionTable::Mbr).unwrap();
        assert_eq!(cmd.to_string(), "parted -s /dev/sdc mklabel msdos");
    }

    #[test]
    fn unknown_table_is_rejected() {
        assert!(mklabel(&ToolPaths::default(), Path::new("/dev/sdc"), PartitionTable::Unknown).is_none());
    }
}
