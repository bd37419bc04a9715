//! Spoken-form normalization.
//!
//! Synthesis engines stumble over digits, bare acronyms and mixed
//! Chinese/Latin runs. Each finalized chunk is rewritten into the form a
//! person would read aloud: numbers become words (Chinese numerals next to
//! Han characters), four-digit years are read as years, acronyms are
//! spelled out letter by letter, and Han/Latin boundaries get a space.

use crate::error::{VoiceError, VoiceResult};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashSet;

/// Largest number either reading supports. Anything bigger fails the chunk,
/// which the segmenter then passes through untouched.
const MAX_READABLE: u64 = 999_999_999_999_999;

static NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(?:,\d{3})*(?:\.\d+)?%?").expect("valid number regex"));
static HAN_THEN_LATIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\p{Han})([A-Za-z0-9])").expect("valid han/latin regex"));
static LATIN_THEN_HAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z0-9])(\p{Han})").expect("valid latin/han regex"));
static ACRONYM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{2,5}\b").expect("valid acronym regex"));

const ONES: [&str; 20] = [
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
    "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen",
    "nineteen",
];
const TENS: [&str; 10] = [
    "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
];
const SCALES: [&str; 5] = ["", "thousand", "million", "billion", "trillion"];

const HAN_DIGITS: [char; 10] = ['零', '一', '二', '三', '四', '五', '六', '七', '八', '九'];
const HAN_SECTION_UNITS: [&str; 4] = ["", "万", "亿", "万亿"];

/// Rewrites a chunk of text into its spoken form.
pub trait TextNormalizer: Send + Sync {
    fn normalize(&self, text: &str) -> VoiceResult<String>;
}

#[derive(Debug, Clone)]
pub struct SpokenFormNormalizer {
    acronym_exceptions: HashSet<String>,
}

impl Default for SpokenFormNormalizer {
    fn default() -> Self {
        Self::with_exceptions(["OK", "AM", "PM"])
    }
}

impl SpokenFormNormalizer {
    /// Acronyms listed here are left as written.
    pub fn with_exceptions<I, S>(exceptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            acronym_exceptions: exceptions.into_iter().map(Into::into).collect(),
        }
    }

    fn spell_acronyms(&self, text: &str) -> String {
        ACRONYM
            .replace_all(text, |caps: &Captures| {
                let word = &caps[0];
                if self.acronym_exceptions.contains(word) {
                    word.to_string()
                } else {
                    word.chars().map(String::from).collect::<Vec<_>>().join(" ")
                }
            })
            .into_owned()
    }
}

impl TextNormalizer for SpokenFormNormalizer {
    fn normalize(&self, text: &str) -> VoiceResult<String> {
        let text = expand_numbers(text)?;
        let text = HAN_THEN_LATIN.replace_all(&text, "$1 $2");
        let text = LATIN_THEN_HAN.replace_all(&text, "$1 $2");
        Ok(self.spell_acronyms(&text))
    }
}

fn is_han(c: char) -> bool {
    matches!(c as u32, 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF)
}

fn expand_numbers(text: &str) -> VoiceResult<String> {
    let mut out = String::with_capacity(text.len() + 16);
    let mut last = 0;
    for m in NUMBER.find_iter(text) {
        let before = text[..m.start()].chars().next_back();
        let after = text[m.end()..].chars().next();
        // A dot glued to the match is part of something else (a version
        // string or an IP address); leave those alone.
        if before == Some('.') || (after == Some('.') && text[m.end() + 1..].starts_with(|c: char| c.is_ascii_digit())) {
            continue;
        }

        let token = m.as_str();
        let (digits, percent) = match token.strip_suffix('%') {
            Some(rest) => (rest, true),
            None => (token, false),
        };
        // "1,234" is a quantity, never a year.
        let grouped = digits.contains(',');
        let digits = digits.replace(',', "");
        let han_context = before.is_some_and(is_han) || after.is_some_and(is_han);

        let spoken = if han_context {
            read_chinese(&digits, percent, after == Some('年'))?
        } else {
            let words = read_english(&digits, percent, grouped)?;
            let mut padded = String::with_capacity(words.len() + 2);
            if before.is_some_and(|c| c.is_alphanumeric()) {
                padded.push(' ');
            }
            padded.push_str(&words);
            if after.is_some_and(|c| c.is_alphanumeric()) {
                padded.push(' ');
            }
            padded
        };

        out.push_str(&text[last..m.start()]);
        out.push_str(&spoken);
        last = m.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

fn parse_integer(digits: &str) -> VoiceResult<u64> {
    let value: u64 = digits
        .parse()
        .map_err(|_| VoiceError::Normalize(format!("number too large to read: {digits}")))?;
    if value > MAX_READABLE {
        return Err(VoiceError::Normalize(format!("number too large to read: {digits}")));
    }
    Ok(value)
}

fn read_english(digits: &str, percent: bool, grouped: bool) -> VoiceResult<String> {
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };

    let mut words = if int_part.len() > 1 && int_part.starts_with('0') {
        int_part
            .chars()
            .filter_map(|c| c.to_digit(10))
            .map(|d| ONES[d as usize])
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        let value = parse_integer(int_part)?;
        let year_like = !grouped && !percent && frac_part.is_none() && int_part.len() == 4;
        if year_like && (1100..=2099).contains(&value) {
            english_year(value)
        } else {
            english_cardinal(value)?
        }
    };

    if let Some(frac) = frac_part {
        words.push_str(" point");
        for d in frac.chars().filter_map(|c| c.to_digit(10)) {
            words.push(' ');
            words.push_str(ONES[d as usize]);
        }
    }
    if percent {
        words.push_str(" percent");
    }
    Ok(words)
}

pub fn english_cardinal(value: u64) -> VoiceResult<String> {
    if value > MAX_READABLE {
        return Err(VoiceError::Normalize(format!("number too large to read: {value}")));
    }
    if value == 0 {
        return Ok(ONES[0].to_string());
    }

    let mut groups = Vec::new();
    let mut rest = value;
    while rest > 0 {
        groups.push((rest % 1000) as u16);
        rest /= 1000;
    }

    let mut parts = Vec::new();
    for (idx, group) in groups.iter().enumerate().rev() {
        if *group == 0 {
            continue;
        }
        let mut part = english_below_thousand(*group);
        if !SCALES[idx].is_empty() {
            part.push(' ');
            part.push_str(SCALES[idx]);
        }
        parts.push(part);
    }
    Ok(parts.join(" "))
}

fn english_below_hundred(n: u16) -> String {
    if n < 20 {
        return ONES[n as usize].to_string();
    }
    let (tens, ones) = (n / 10, n % 10);
    if ones == 0 {
        TENS[tens as usize].to_string()
    } else {
        format!("{}-{}", TENS[tens as usize], ONES[ones as usize])
    }
}

fn english_below_thousand(n: u16) -> String {
    let (hundreds, rest) = (n / 100, n % 100);
    match (hundreds, rest) {
        (0, r) => english_below_hundred(r),
        (h, 0) => format!("{} hundred", ONES[h as usize]),
        (h, r) => format!("{} hundred {}", ONES[h as usize], english_below_hundred(r)),
    }
}

/// 1905 → "nineteen oh five", 2000 → "two thousand", 2024 → "twenty twenty-four".
pub fn english_year(year: u64) -> String {
    if (2000..=2009).contains(&year) {
        return match year % 10 {
            0 => "two thousand".to_string(),
            d => format!("two thousand {}", ONES[d as usize]),
        };
    }
    let (high, low) = ((year / 100) as u16, (year % 100) as u16);
    let high = english_below_hundred(high);
    match low {
        0 => format!("{high} hundred"),
        1..=9 => format!("{high} oh {}", ONES[low as usize]),
        _ => format!("{high} {}", english_below_hundred(low)),
    }
}

fn read_chinese(digits: &str, percent: bool, is_year: bool) -> VoiceResult<String> {
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };

    let mut spoken = String::new();
    if percent {
        spoken.push_str("百分之");
    }

    if (is_year && frac_part.is_none()) || (int_part.len() > 1 && int_part.starts_with('0')) {
        spoken.extend(han_digit_string(int_part));
    } else {
        spoken.push_str(&chinese_cardinal(parse_integer(int_part)?)?);
    }

    if let Some(frac) = frac_part {
        spoken.push('点');
        spoken.extend(han_digit_string(frac));
    }
    Ok(spoken)
}

fn han_digit_string(digits: &str) -> impl Iterator<Item = char> + '_ {
    digits
        .chars()
        .filter_map(|c| c.to_digit(10))
        .map(|d| HAN_DIGITS[d as usize])
}

/// 10005 → 一万零五, 12 → 十二, 110 → 一百一十.
pub fn chinese_cardinal(value: u64) -> VoiceResult<String> {
    if value > MAX_READABLE {
        return Err(VoiceError::Normalize(format!("number too large to read: {value}")));
    }
    if value == 0 {
        return Ok(HAN_DIGITS[0].to_string());
    }

    let mut sections = Vec::new();
    let mut rest = value;
    while rest > 0 {
        sections.push((rest % 10_000) as u16);
        rest /= 10_000;
    }

    let mut out = String::new();
    let mut gap = false;
    for (idx, section) in sections.iter().enumerate().rev() {
        if *section == 0 {
            gap = !out.is_empty();
            continue;
        }
        if !out.is_empty() && (gap || *section < 1000) {
            out.push('零');
        }
        gap = false;
        out.push_str(&chinese_section(*section));
        out.push_str(HAN_SECTION_UNITS[idx]);
    }

    if let Some(rest) = out.strip_prefix("一十") {
        out = format!("十{rest}");
    }
    Ok(out)
}

fn chinese_section(section: u16) -> String {
    let mut out = String::new();
    let mut zero = false;
    for (unit, name) in [(1000, "千"), (100, "百"), (10, "十"), (1, "")] {
        let digit = (section / unit % 10) as usize;
        if digit == 0 {
            zero = !out.is_empty();
            continue;
        }
        if zero {
            out.push('零');
            zero = false;
        }
        out.push(HAN_DIGITS[digit]);
        out.push_str(name);
    }
    out
}
