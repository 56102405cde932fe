//! Parsing for `cryptsetup luksDump` output.

/// Count the key slots in use according to `luksDump` output.
///
/// Understands both header versions: LUKS1 lists every slot as `Key Slot N: ENABLED|DISABLED`,
/// LUKS2 lists only the slots in use as `  N: luks2` beneath a `Keyslots:` heading.
pub fn count_active_slots(dump: &str) -> usize {
    let luks1 = dump
        .lines()
        .filter(|line| {
            line.trim_start()
                .strip_prefix("Key Slot ")
                .and_then(|rest| rest.split_once(':'))
                .is_some_and(|(_, state)| state.trim() == "ENABLED")
        })
        .count();
    if luks1 > 0 {
        return luks1;
    }

    let mut in_keyslots = false;
    let mut count = 0;
    for line in dump.lines() {
        if !line.starts_with(char::is_whitespace) && !line.trim().is_empty() {
            in_keyslots = line.trim_end() == "Keyslots:";
            continue;
        }
        if !in_keyslots || line.starts_with('\t') {
            continue;
        }
        let entry = line.trim();
        if let Some((index, _)) = entry.split_once(':') {
            if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) {
                count += 1;
            }
        }
    }
    count
}
