/// Run identifiers and ephemeral resource names
///
/// Every object a run creates is named `<prefix><uid>`, so the UID alone is
/// enough to find and remove a run's leftovers.
use rand::rngs::OsRng;
use rand::RngCore;

/// Lowercase so generated names stay valid DNS-1123 labels
pub const UID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
pub const UID_LENGTH: usize = 6;

// Largest multiple of the alphabet size that fits in a byte; bytes at or
// above it are rejected to keep the draw uniform.
const ACCEPT_BELOW: u8 = (256 / UID_ALPHABET.len() * UID_ALPHABET.len()) as u8;

/// Generate a run UID from the OS random source
///
/// 36^6 (about 2.2e9) possible values: among n runs sharing a namespace the
/// chance of any collision is roughly n² / 4.4e9, so about 1 in 4400 for a
/// thousand runs. Uniqueness is never assumed beyond that.
pub fn new_run_uid() -> Result<String, rand::Error> {
    let mut uid = String::with_capacity(UID_LENGTH);
    let mut buf = [0u8; 16];
    while uid.len() < UID_LENGTH {
        OsRng.try_fill_bytes(&mut buf)?;
        for byte in buf {
            if byte < ACCEPT_BELOW && uid.len() < UID_LENGTH {
                uid.push(UID_ALPHABET[byte as usize % UID_ALPHABET.len()] as char);
            }
        }
    }
    Ok(uid)
}

/// Whether `uid` has the shape [`new_run_uid`] produces
pub fn is_valid_run_uid(uid: &str) -> bool {
    uid.len() == UID_LENGTH && uid.bytes().all(|b| UID_ALPHABET.contains(&b))
}

pub const DNS_POD_PREFIX: &str = "dnsutils-";
pub const SOURCE_PVC_PREFIX: &str = "source-pvc-";
pub const SOURCE_POD_PREFIX: &str = "source-pod-";
pub const SNAPSHOT_PREFIX: &str = "snapshot-source-pvc-";
pub const RESTORE_PVC_PREFIX: &str = "restored-pvc-";
pub const RESTORE_POD_PREFIX: &str = "restored-pod-";
pub const UNMOUNTED_SNAPSHOT_PREFIX: &str = "unmounted-snapshot-src-";
pub const UNMOUNTED_RESTORE_PVC_PREFIX: &str = "unmounted-restored-pvc-";
pub const UNMOUNTED_RESTORE_POD_PREFIX: &str = "unmounted-restored-pod-";

pub fn resource_name(prefix: &str, uid: &str) -> String {
    format!("{}{}", prefix, uid)
}
