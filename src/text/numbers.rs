//! Sino-Korean reading of Arabic numerals.

const DIGITS: [&str; 10] = ["영", "일", "이", "삼", "사", "오", "육", "칠", "팔", "구"];
const SMALL_UNITS: [&str; 4] = ["", "십", "백", "천"];
const LARGE_UNITS: [&str; 5] = ["", "만", "억", "조", "경"];

/// Longest integer read with place units; longer runs are read digit by digit.
const MAX_UNIT_DIGITS: usize = 4 * LARGE_UNITS.len();

/// Replace every number in `text` (optionally with `,` thousands separators
/// and a `.` decimal part) by its Sino-Korean reading.
pub fn normalize_numbers(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        let mut integer = String::new();
        while i < chars.len() {
            let c = chars[i];
            if c.is_ascii_digit() {
                integer.push(c);
                i += 1;
            } else if c == ',' && is_thousands_group(&chars[i + 1..]) {
                i += 1;
            } else {
                break;
            }
        }

        let mut fraction = String::new();
        if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                fraction.push(chars[i]);
                i += 1;
            }
        }

        out.push_str(&read_integer(&integer));
        if !fraction.is_empty() {
            out.push('점');
            out.push_str(&read_digits(&fraction));
        }
    }

    out
}

fn is_thousands_group(rest: &[char]) -> bool {
    rest.len() >= 3
        && rest[..3].iter().all(char::is_ascii_digit)
        && rest.get(3).is_none_or(|c| !c.is_ascii_digit())
}

/// Read an ASCII digit string with place units, e.g. `"1205"` → `천이백오`.
pub fn read_integer(digits: &str) -> String {
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return DIGITS[0].to_string();
    }
    if digits.len() > MAX_UNIT_DIGITS {
        return read_digits(digits);
    }

    let values: Vec<usize> = digits.bytes().map(|b| (b - b'0') as usize).collect();
    let group_count = values.len().div_ceil(4);
    let mut out = String::new();

    for group in (0..group_count).rev() {
        let end = values.len() - group * 4;
        let start = end.saturating_sub(4);
        let chunk = &values[start..end];
        if chunk.iter().all(|&d| d == 0) {
            continue;
        }
        // A leading 10000 is read 만, not 일만.
        if group == 1 && group + 1 == group_count && *chunk == [1] {
            out.push_str(LARGE_UNITS[1]);
            continue;
        }
        out.push_str(&read_group(chunk));
        out.push_str(LARGE_UNITS[group]);
    }

    out
}

/// Read up to four digits with 십/백/천 units.
fn read_group(chunk: &[usize]) -> String {
    let mut out = String::new();
    for (i, &digit) in chunk.iter().enumerate() {
        let place = chunk.len() - 1 - i;
        if digit == 0 {
            continue;
        }
        if !(digit == 1 && place > 0) {
            out.push_str(DIGITS[digit]);
        }
        out.push_str(SMALL_UNITS[place]);
    }
    out
}

fn read_digits(digits: &str) -> String {
    digits
        .bytes()
        .filter(u8::is_ascii_digit)
        .map(|b| DIGITS[(b - b'0') as usize])
        .collect()
}
