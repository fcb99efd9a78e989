//! Character to qcode translation for `type_text`.

/// Characters typed with a single unshifted key other than letters/digits.
pub const SPECIAL_KEYS: &[(char, &str)] = &[
    (' ', "spc"),
    ('\n', "ret"),
    ('\r', "ret"),
    ('\t', "tab"),
    ('.', "dot"),
    (',', "comma"),
    (';', "semicolon"),
    ('\'', "apostrophe"),
    ('`', "grave_accent"),
    ('-', "minus"),
    ('=', "equal"),
    ('[', "bracket_left"),
    (']', "bracket_right"),
    ('\\', "backslash"),
    ('/', "slash"),
];

/// Characters that need shift held together with the listed key.
pub const SHIFT_KEYS: &[(char, &str)] = &[
    ('!', "1"),
    ('@', "2"),
    ('#', "3"),
    ('$', "4"),
    ('%', "5"),
    ('^', "6"),
    ('&', "7"),
    ('*', "8"),
    ('(', "9"),
    (')', "0"),
    ('_', "minus"),
    ('+', "equal"),
    ('{', "bracket_left"),
    ('}', "bracket_right"),
    ('|', "backslash"),
    (':', "semicolon"),
    ('"', "apostrophe"),
    ('<', "comma"),
    ('>', "dot"),
    ('?', "slash"),
    ('~', "grave_accent"),
];

pub const SHIFT: &str = "shift";

fn lookup(table: &[(char, &'static str)], c: char) -> Option<&'static str> {
    table.iter().find(|(key, _)| *key == c).map(|(_, qcode)| *qcode)
}

/// Keys to press together for `c`, or `None` if it cannot be typed.
pub fn keys_for_char(c: char) -> Option<Vec<String>> {
    if let Some(qcode) = lookup(SPECIAL_KEYS, c) {
        return Some(vec![qcode.to_string()]);
    }
    if let Some(qcode) = lookup(SHIFT_KEYS, c) {
        return Some(vec![SHIFT.to_string(), qcode.to_string()]);
    }
    if c.is_ascii_uppercase() {
        return Some(vec![SHIFT.to_string(), c.to_ascii_lowercase().to_string()]);
    }
    if c.is_ascii_alphanumeric() {
        return Some(vec![c.to_string()]);
    }
    None
}
