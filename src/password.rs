//! Password policy.
//!
//! A password is accepted when every [`PasswordRule`] holds. The strength
//! score is reported separately so the signup form can show a meter.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

pub const MIN_LENGTH: usize = 8;
pub const MAX_LENGTH: usize = 128;

lazy_static! {
    static ref UPPERCASE: Regex = Regex::new(r"\p{Lu}").unwrap();
    static ref LOWERCASE: Regex = Regex::new(r"\p{Ll}").unwrap();
    static ref DIGIT: Regex = Regex::new(r"[0-9]").unwrap();
    static ref SPECIAL: Regex = Regex::new(r#"[!@#$%^&*()_+\-=\[\]{};':"\\|,.<>/?`~]"#).unwrap();
}

const COMMON_PASSWORDS: &[&str] = &[
    "password",
    "password1",
    "password123",
    "12345678",
    "123456789",
    "qwerty123",
    "iloveyou",
    "admin123",
    "welcome1",
    "letmein1",
    "mikkitrade",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordRule {
    MinLength,
    MaxLength,
    Uppercase,
    Lowercase,
    Digit,
    SpecialCharacter,
    NotCommon,
}

impl PasswordRule {
    pub fn message(self) -> String {
        match self {
            PasswordRule::MinLength => format!("Password must be at least {} characters long", MIN_LENGTH),
            PasswordRule::MaxLength => format!("Password must be at most {} characters long", MAX_LENGTH),
            PasswordRule::Uppercase => "Password must contain at least one uppercase letter".into(),
            PasswordRule::Lowercase => "Password must contain at least one lowercase letter".into(),
            PasswordRule::Digit => "Password must contain at least one number".into(),
            PasswordRule::SpecialCharacter => "Password must contain at least one special character".into(),
            PasswordRule::NotCommon => "Password is too common".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PasswordCheck {
    pub valid: bool,
    /// 0 (very weak) ..= 4 (strong)
    pub score: u8,
    pub errors: Vec<PasswordRule>,
}

impl PasswordCheck {
    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|r| r.message()).collect()
    }
}

pub fn validate_password(password: &str) -> PasswordCheck {
    let len = password.chars().count();
    let has_upper = UPPERCASE.is_match(password);
    let has_lower = LOWERCASE.is_match(password);
    let has_digit = DIGIT.is_match(password);
    let has_special = SPECIAL.is_match(password);
    let is_common = COMMON_PASSWORDS.contains(&password.to_lowercase().as_str());

    let mut errors = Vec::new();
    if len < MIN_LENGTH {
        errors.push(PasswordRule::MinLength);
    }
    if len > MAX_LENGTH {
        errors.push(PasswordRule::MaxLength);
    }
    if !has_upper {
        errors.push(PasswordRule::Uppercase);
    }
    if !has_lower {
        errors.push(PasswordRule::Lowercase);
    }
    if !has_digit {
        errors.push(PasswordRule::Digit);
    }
    if !has_special {
        errors.push(PasswordRule::SpecialCharacter);
    }
    if is_common {
        errors.push(PasswordRule::NotCommon);
    }

    let classes = [has_upper, has_lower, has_digit, has_special].iter().filter(|b| **b).count() as u8;
    let mut score = match len {
        0..=7 => 0,
        _ => classes.saturating_sub(1),
    };
    if len >= 12 {
        score += 1;
    }
    if is_common {
        score = 0;
    }

    PasswordCheck { valid: errors.is_empty(), score: score.min(4), errors }
}
