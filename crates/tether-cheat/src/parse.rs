//! Cheat definition text and toggles grammar.
//!
//! `[name]` opens a regular cheat, `{name}` the (single) master cheat;
//! bodies are whitespace-separated 8-hex-digit dwords. Parsing is strict:
//! any unexpected input rejects the whole file and the caller keeps no
//! partial entries.

pub const MAX_CHEAT_COUNT: usize = 0x80;
pub const MAX_CHEAT_NAME_LEN: usize = 63;
pub const MAX_CHEAT_OPCODES: usize = 0x100;

/// Bounded opcode storage; a cheat can never exceed 256 dwords.
pub type OpcodeList = tinyvec::ArrayVec<[u32; MAX_CHEAT_OPCODES]>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheatDefinition {
    pub readable_name: String,
    pub opcodes: OpcodeList,
}

impl CheatDefinition {
    pub fn is_empty(&self) -> bool {
        self.opcodes.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheatEntry {
    pub enabled: bool,
    pub cheat_id: u32,
    pub definition: CheatDefinition,
}

fn empty_entries() -> Vec<CheatEntry> {
    (0..MAX_CHEAT_COUNT as u32)
        .map(|cheat_id| CheatEntry { cheat_id, ..Default::default() })
        .collect()
}

/// Extracts a bracketed name, returning it with the byte index just past
/// the closing delimiter.
fn parse_name(bytes: &[u8], start: usize, close: u8) -> Option<(String, usize)> {
    let mut end = start;
    loop {
        if end >= bytes.len() || end - start > MAX_CHEAT_NAME_LEN {
            return None;
        }
        if bytes[end] == close {
            break;
        }
        end += 1;
    }
    let name = std::str::from_utf8(&bytes[start..end]).ok()?.to_owned();
    Some((name, end + 1))
}

/// Parses a cheat file into the fixed entry table. Entry 0 is the master
/// cheat; regular cheats fill slots 1.. in order. `None` on any parse
/// error, leaving the caller's entry set untouched (so: empty).
pub fn parse_cheats(text: &str, enable_by_default: bool) -> Option<Vec<CheatEntry>> {
    let bytes = text.as_bytes();
    let mut entries = empty_entries();
    let mut next_slot = 1;
    let mut current: Option<usize> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
        } else if b == b'[' {
            if next_slot >= MAX_CHEAT_COUNT {
                return None;
            }
            let (name, next) = parse_name(bytes, i + 1, b']')?;
            entries[next_slot].definition.readable_name = name;
            current = Some(next_slot);
            next_slot += 1;
            i = next;
        } else if b == b'{' {
            // Exactly one master cheat.
            if !entries[0].definition.is_empty() || !entries[0].definition.readable_name.is_empty()
            {
                return None;
            }
            let (name, next) = parse_name(bytes, i + 1, b'}')?;
            entries[0].definition.readable_name = name;
            current = Some(0);
            i = next;
        } else if b.is_ascii_hexdigit() {
            let slot = current?;
            if entries[slot].definition.opcodes.len() >= MAX_CHEAT_OPCODES {
                return None;
            }
            let word = bytes.get(i..i + 8)?;
            let word = std::str::from_utf8(word).ok()?;
            let opcode = u32::from_str_radix(word, 16).ok()?;
            entries[slot].definition.opcodes.push(opcode);
            i += 8;
        } else {
            return None;
        }
    }

    // The master cheat is always on when present; the rest follow policy.
    if !entries[0].definition.is_empty() {
        entries[0].enabled = true;
    }
    for entry in entries.iter_mut().skip(1) {
        if !entry.definition.is_empty() {
            entry.enabled = enable_by_default;
        }
    }
    Some(entries)
}

/// Parses the toggles file: `[name]` followed by a truthiness word. Unknown
/// names are tolerated; anything else malformed rejects the file.
pub fn parse_cheat_toggles(text: &str) -> Option<Vec<(String, bool)>> {
    let bytes = text.as_bytes();
    let mut toggles = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if b != b'[' {
            return None;
        }
        let (name, next) = parse_name(bytes, i + 1, b']')?;
        i = next;

        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let word_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let word = std::str::from_utf8(&bytes[word_start..i]).ok()?;
        let value = match word.to_ascii_lowercase().as_str() {
            "1" | "true" | "on" => true,
            "0" | "false" | "off" => false,
            _ => return None,
        };
        toggles.push((name, value));
    }
    Some(toggles)
}

/// Renders the toggles file for every non-empty regular cheat.
pub fn format_cheat_toggles(entries: &[CheatEntry]) -> String {
    let mut out = String::new();
    for entry in entries.iter().skip(1) {
        if !entry.definition.is_empty() {
            out.push_str(&format!(
                "[{}]\n{}\n",
                entry.definition.readable_name,
                if entry.enabled { "true" } else { "false" }
            ));
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_master_and_regular_cheats() {
        let text = "{Master Cheat}\n04000000 01234567\n[Moon Jump]\n80000001 20000000\n";
        let entries = parse_cheats(text, true).unwrap();

        assert_eq!(entries[0].definition.readable_name, "Master Cheat");
        assert!(entries[0].enabled);
        assert_eq!(&entries[0].definition.opcodes[..], &[0x0400_0000, 0x0123_4567]);

        assert_eq!(entries[1].definition.readable_name, "Moon Jump");
        assert!(entries[1].enabled);
        assert_eq!(&entries[1].definition.opcodes[..], &[0x8000_0001, 0x2000_0000]);
    }

    #[test]
    fn enable_by_default_off_leaves_regulars_disabled() {
        let entries = parse_cheats("[A]\n20000000\n", false).unwrap();
        assert!(!entries[1].enabled);
    }

    #[test]
    fn rejects_unexpected_characters_entirely() {
        assert!(parse_cheats("[A]\n20000000\n!!!", true).is_none());
        assert!(parse_cheats("zzzzzzzz", true).is_none());
    }

    #[test]
    fn rejects_opcodes_before_any_header() {
        assert!(parse_cheats("20000000", true).is_none());
    }

    #[test]
    fn rejects_short_hex_word() {
        assert!(parse_cheats("[A]\n2000", true).is_none());
    }

    #[test]
    fn rejects_two_master_cheats() {
        assert!(parse_cheats("{M}\n20000000\n{N}\n20000000\n", true).is_none());
    }

    #[test]
    fn rejects_overlong_name() {
        let name = "x".repeat(MAX_CHEAT_NAME_LEN + 1);
        assert!(parse_cheats(&format!("[{name}]\n20000000\n"), true).is_none());
    }

    #[test]
    fn toggles_grammar() {
        let toggles = parse_cheat_toggles("[Moon Jump]\ntrue\n[Run Fast]\noff\n").unwrap();
        assert_eq!(toggles, vec![("Moon Jump".into(), true), ("Run Fast".into(), false)]);

        assert!(parse_cheat_toggles("[A]\nmaybe\n").is_none());
        assert!(parse_cheat_toggles("true\n").is_none());
    }

    #[test]
    fn toggles_roundtrip_through_formatter() {
        let entries = parse_cheats("[A]\n20000000\n[B]\n20000000\n", true).unwrap();
        let formatted = format_cheat_toggles(&entries);
        let parsed = parse_cheat_toggles(&formatted).unwrap();
        assert_eq!(parsed, vec![("A".into(), true), ("B".into(), true)]);
    }
}
