//! Parsers for the free-text output of the external utilities media are probed with.
//!
//! The formats are not stable interfaces, so every parser is lenient: unknown lines are ignored
//! and missing fields come back as `None` rather than as a guessed value.

use lazy_regex::regex;

use crate::DiskState;

/// Drive status markers printed by `setcd -i`, in match priority order.
const DRIVE_STATUS_MARKERS: [(&str, DiskState); 4] = [
    ("is open", DiskState::Open),
    ("not ready", DiskState::NotReady),
    ("disc found", DiskState::Ready),
    ("no disc", DiskState::Empty),
];

const VOLUME_ID_MARKER: &str = "volume id:";
const VOLUME_SIZE_MARKER: &str = "volume size is:";
const LOGICAL_BLOCK_SIZE_MARKER: &str = "logical block size is:";

/// Map `setcd -i <device>` output to a drive state.
///
/// Returns `None` when the output carries none of the known markers, in which case callers keep
/// whatever state they had before.
pub fn parse_drive_status(output: &str) -> Option<DiskState> {
    let output = output.to_ascii_lowercase();
    DRIVE_STATUS_MARKERS
        .iter()
        .find(|(marker, _)| output.contains(marker))
        .map(|(_, state)| *state)
}

/// Fields of interest from an ISO 9660 primary volume descriptor as printed by `isoinfo -d`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub label: Option<String>,
    /// Volume size in logical blocks.
    pub volume_size: Option<u64>,
    pub logical_block_size: Option<u64>,
}

impl VolumeDescriptor {
    /// Medium size in bytes, if both factors were reported and the product fits.
    pub fn byte_size(&self) -> Option<u64> {
        self.volume_size?.checked_mul(self.logical_block_size?)
    }
}

/// Parse `isoinfo -d -i <path>` output. The first occurrence of each marker wins.
pub fn parse_volume_descriptor(output: &str) -> VolumeDescriptor {
    let mut desc = VolumeDescriptor::default();

    for line in output.lines() {
        if desc.label.is_none() {
            if let Some(value) = strip_marker(line, VOLUME_ID_MARKER) {
                let value = value.trim();
                if !value.is_empty() {
                    desc.label = Some(value.to_string());
                }
                continue;
            }
        }
        if desc.volume_size.is_none() {
            if let Some(value) = strip_marker(line, VOLUME_SIZE_MARKER) {
                desc.volume_size = value.trim().parse().ok();
                continue;
            }
        }
        if desc.logical_block_size.is_none() {
            if let Some(value) = strip_marker(line, LOGICAL_BLOCK_SIZE_MARKER) {
                desc.logical_block_size = value.trim().parse().ok();
            }
        }
    }

    desc
}

/// Case-insensitive `strip_prefix`.
fn strip_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let head = line.get(..marker.len())?;
    if head.eq_ignore_ascii_case(marker) {
        line.get(marker.len()..)
    } else {
        None
    }
}

/// Extract optical drive device nodes from `wodim --devices` output.
///
/// Every `dev='...'` token is collected; lines without one are skipped. The result is sorted and
/// deduplicated.
pub fn parse_device_list(output: &str) -> Vec<String> {
    let mut devices: Vec<String> = regex!(r"dev='([^']*)'")
        .captures_iter(output)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|dev| !dev.is_empty())
        .map(str::to_string)
        .collect();
    devices.sort();
    devices.dedup();
    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISOINFO_OUTPUT: &str = "CD-ROM is in ISO 9660 format\n\
        System id: LINUX\n\
        Volume id: Ubuntu 22.04 LTS amd64\n\
        Volume set id: \n\
        Publisher id: \n\
        Logical block size is: 2048\n\
        Volume size is: 1834944\n\
        El Torito VD version 1 found, boot catalog is in sector 1234\n";

    #[test]
    fn drive_status_markers() {
        let cases = [
            ("/dev/sr0:\n  CD tray is open\n", Some(DiskState::Open)),
            ("/dev/sr0:\n  Drive is not ready\n", Some(DiskState::NotReady)),
            (
                "/dev/sr0:\n  Disc found in drive: data disc type 1\n",
                Some(DiskState::Ready),
            ),
            ("/dev/sr0:\n  No disc is inserted\n", Some(DiskState::Empty)),
            ("/dev/sr0:\n  something unexpected\n", None),
            ("", None),
        ];
        for (output, expected) in cases {
            assert_eq!(parse_drive_status(output), expected, "output={output:?}");
        }
    }

    #[test]
    fn first_listed_marker_wins() {
        assert_eq!(
            parse_drive_status("Drive is not ready, no disc detected yet"),
            Some(DiskState::NotReady)
        );
        assert_eq!(
            parse_drive_status("DISC FOUND but tray IS OPEN"),
            Some(DiskState::Open)
        );
    }

    #[test]
    fn volume_descriptor_fields() {
        let desc = parse_volume_descriptor(ISOINFO_OUTPUT);
        assert_eq!(desc.label.as_deref(), Some("Ubuntu 22.04 LTS amd64"));
        assert_eq!(desc.logical_block_size, Some(2048));
        assert_eq!(desc.volume_size, Some(1_834_944));
        assert_eq!(desc.byte_size(), Some(1_834_944 * 2048));
    }

    #[test]
    fn volume_id_marker_is_case_insensitive() {
        let desc = parse_volume_descriptor("VOLUME ID:   INSTALL_DISC  \n");
        assert_eq!(desc.label.as_deref(), Some("INSTALL_DISC"));
    }

    #[test]
    fn blank_or_missing_label_is_absent() {
        assert_eq!(parse_volume_descriptor("Volume id:   \n").label, None);
        assert_eq!(parse_volume_descriptor("Volume set id: X\n").label, None);
        assert_eq!(parse_volume_descriptor("").label, None);
    }

    #[test]
    fn size_needs_both_factors() {
        let desc = parse_volume_descriptor("Volume size is: 100\n");
        assert_eq!(desc.byte_size(), None);

        let desc = parse_volume_descriptor("Logical block size is: abc\nVolume size is: 100\n");
        assert_eq!(desc.logical_block_size, None);
        assert_eq!(desc.byte_size(), None);
    }

    #[test]
    fn device_list_is_sorted_and_skips_noise() {
        let output = "wodim: Overview of accessible drives (2 found) :\n\
            -------------------------------------------------------------------------\n \
             0  dev='/dev/sr1'\trwrw-- : 'HL-DT-ST' 'DVDRAM GH24NS95'\n \
             1  dev='/dev/sr0'\trwrw-- : 'ASUS' 'DRW-24F1ST'\n\
            -------------------------------------------------------------------------\n";
        assert_eq!(parse_device_list(output), vec!["/dev/sr0", "/dev/sr1"]);
        assert!(parse_device_list("wodim: No drives found\n").is_empty());
    }
}
