//! Cryptographically secure randomness.
//!
//! Everything here draws from `rand::thread_rng`, a CSPRNG seeded from the
//! operating system on first use in each thread.

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};

use crate::keys::Salt;
use securevault_common::{Error, Result};

const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%^&*()-_=+[]{}|;:,.<>?";

/// Shortest password `generate_password` will produce.
pub const MIN_GENERATED_PASSWORD_LENGTH: usize = 4;

/// Shortest password accepted for a new volume.
pub const MIN_PASSWORD_LENGTH: usize = 12;

/// Character classes a new-volume password must draw from, out of four.
pub const MIN_PASSWORD_CLASSES: usize = 3;

/// Fill a fresh buffer with `len` random bytes.
pub fn generate_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a salt for a new volume.
pub fn generate_salt() -> Salt {
    Salt::generate()
}

/// Generate a random password of `length` characters.
///
/// The result always contains at least one uppercase letter, one lowercase
/// letter, one digit and one symbol.
pub fn generate_password(length: usize) -> Result<String> {
    if length < MIN_GENERATED_PASSWORD_LENGTH {
        return Err(Error::InvalidInput(format!(
            "Password length must be at least {}",
            MIN_GENERATED_PASSWORD_LENGTH
        )));
    }

    let mut rng = rand::thread_rng();
    let mut chars = Vec::with_capacity(length);

    for class in [UPPERCASE, LOWERCASE, DIGITS, SYMBOLS] {
        chars.push(class[rng.gen_range(0..class.len())]);
    }

    let all: Vec<u8> = [UPPERCASE, LOWERCASE, DIGITS, SYMBOLS].concat();
    while chars.len() < length {
        chars.push(all[rng.gen_range(0..all.len())]);
    }

    chars.shuffle(&mut rng);

    // Every byte comes from the ASCII tables above
    Ok(chars.into_iter().map(char::from).collect())
}

/// Check a password chosen for a new volume.
///
/// Requires [`MIN_PASSWORD_LENGTH`] characters and at least
/// [`MIN_PASSWORD_CLASSES`] of uppercase, lowercase, digits and symbols.
///
/// # Errors
/// - `InvalidInput` describing the unmet rule
pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(Error::InvalidInput(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }

    let classes = CharClasses::of(password).count();
    if classes < MIN_PASSWORD_CLASSES {
        return Err(Error::InvalidInput(format!(
            "Password must mix at least {} of uppercase, lowercase, digits and symbols",
            MIN_PASSWORD_CLASSES
        )));
    }

    Ok(())
}

/// Rough strength score from 0 to 100.
///
/// Length contributes up to 30, character classes up to 65 and distinct
/// characters up to 15, capped at 100.
pub fn password_strength(password: &str) -> u8 {
    let length = password.chars().count();
    if length == 0 {
        return 0;
    }

    let mut score: usize = match length {
        20.. => 30,
        16..=19 => 25,
        12..=15 => 20,
        8..=11 => 10,
        _ => 0,
    };

    let classes = CharClasses::of(password);
    score += [
        (classes.upper, 15),
        (classes.lower, 15),
        (classes.digit, 15),
        (classes.symbol, 20),
    ]
    .iter()
    .filter(|(present, _)| *present)
    .map(|(_, points)| points)
    .sum::<usize>();

    let mut distinct: Vec<char> = password.chars().collect();
    distinct.sort_unstable();
    distinct.dedup();
    score += (distinct.len() * 2).min(15);

    score.min(100) as u8
}

#[derive(Default)]
struct CharClasses {
    upper: bool,
    lower: bool,
    digit: bool,
    symbol: bool,
}

impl CharClasses {
    fn of(password: &str) -> Self {
        password.chars().fold(Self::default(), |mut classes, c| {
            if c.is_uppercase() {
                classes.upper = true;
            } else if c.is_lowercase() {
                classes.lower = true;
            } else if c.is_numeric() {
                classes.digit = true;
            } else if !c.is_alphanumeric() {
                classes.symbol = true;
            }
            classes
        })
    }

    fn count(&self) -> usize {
        [self.upper, self.lower, self.digit, self.symbol]
            .iter()
            .filter(|present| **present)
            .count()
    }
}
