use rand::{seq::SliceRandom, Rng};
use thiserror::Error;

use crate::resources::{GeneratorDefinition, GeneratorKind, PasswordSpec};

const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &str = "0123456789";
const SYMBOLS: &str = "~!@#$%^&*()_+`-={}|[]\\:\"<>?,./";

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("requested {requested} characters but only {available} are available without repeats")]
    NotEnoughCharacters { requested: usize, available: usize },

    #[error("{digits} digits and {symbols} symbols do not fit in a password of length {length}")]
    TooManyClasses {
        length: usize,
        digits: usize,
        symbols: usize,
    },

    #[error("symbol alphabet is empty")]
    EmptySymbols,
}

/// Produce a value for the given generator definition
pub fn generate(definition: &GeneratorDefinition) -> Result<String, Error> {
    match definition.kind {
        GeneratorKind::Uuid => Ok(uuid::Uuid::new_v4().to_string()),
        GeneratorKind::Password => {
            let default_spec = PasswordSpec::default();
            password(
                definition.password_spec.as_ref().unwrap_or(&default_spec),
                &mut rand::thread_rng(),
            )
        }
    }
}

/// Generate a password with an exact number of digits and symbols, letters filling the rest
pub fn password<R: Rng + ?Sized>(spec: &PasswordSpec, rng: &mut R) -> Result<String, Error> {
    let length = spec.length;
    let digits = spec.digits.unwrap_or(length / 4);
    let symbols = spec.symbols.unwrap_or(length / 4);
    if digits + symbols > length {
        return Err(Error::TooManyClasses {
            length,
            digits,
            symbols,
        });
    }

    let symbol_alphabet = spec.symbol_characters.as_deref().unwrap_or(SYMBOLS);
    if symbols > 0 && symbol_alphabet.is_empty() {
        return Err(Error::EmptySymbols);
    }

    let letters: String = if spec.no_upper {
        LOWER.to_string()
    } else {
        format!("{LOWER}{UPPER}")
    };

    let mut out: Vec<char> = Vec::with_capacity(length);
    draw(&mut out, DIGITS, digits, spec.allow_repeat, rng)?;
    draw(&mut out, symbol_alphabet, symbols, spec.allow_repeat, rng)?;
    draw(&mut out, &letters, length - digits - symbols, spec.allow_repeat, rng)?;
    out.shuffle(rng);

    Ok(out.into_iter().collect())
}

fn draw<R: Rng + ?Sized>(
    out: &mut Vec<char>,
    alphabet: &str,
    count: usize,
    allow_repeat: bool,
    rng: &mut R,
) -> Result<(), Error> {
    let chars: Vec<char> = alphabet.chars().collect();
    if allow_repeat {
        for _ in 0..count {
            if let Some(c) = chars.choose(rng) {
                out.push(*c);
            }
        }
        return Ok(());
    }

    let available: Vec<char> = chars.into_iter().filter(|c| !out.contains(c)).collect();
    if available.len() < count {
        return Err(Error::NotEnoughCharacters {
            requested: count,
            available: available.len(),
        });
    }
    out.extend(available.choose_multiple(rng, count));

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn default_password_has_expected_composition() {
        let mut rng = StdRng::seed_from_u64(7);
        let pw = password(&PasswordSpec::default(), &mut rng).unwrap();

        assert_eq!(pw.chars().count(), 24);
        assert_eq!(pw.chars().filter(|c| c.is_ascii_digit()).count(), 6);
        assert_eq!(pw.chars().filter(|c| SYMBOLS.contains(*c)).count(), 6);
        let unique: HashSet<char> = pw.chars().collect();
        assert_eq!(unique.len(), 24);
    }

    #[test]
    fn no_upper_only_uses_lowercase_letters() {
        let spec = PasswordSpec {
            length: 20,
            digits: Some(0),
            symbols: Some(0),
            no_upper: true,
            ..Default::default()
        };
        let pw = password(&spec, &mut StdRng::seed_from_u64(1)).unwrap();
        assert!(pw.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn repeats_are_rejected_when_alphabet_is_too_small() {
        let spec = PasswordSpec {
            length: 12,
            digits: Some(11),
            symbols: Some(0),
            ..Default::default()
        };
        let err = password(&spec, &mut StdRng::seed_from_u64(1)).unwrap_err();
        assert_eq!(
            err,
            Error::NotEnoughCharacters {
                requested: 11,
                available: 10
            }
        );

        let spec = PasswordSpec {
            allow_repeat: true,
            ..spec
        };
        assert!(password(&spec, &mut StdRng::seed_from_u64(1)).is_ok());
    }

    #[test]
    fn custom_symbols_are_honoured() {
        let spec = PasswordSpec {
            length: 8,
            digits: Some(0),
            symbols: Some(2),
            symbol_characters: Some("-_".into()),
            ..Default::default()
        };
        let pw = password(&spec, &mut StdRng::seed_from_u64(3)).unwrap();
        assert!(pw.contains('-') && pw.contains('_'));
    }

    #[test]
    fn uuid_generator_yields_v4() {
        let value = generate(&GeneratorDefinition {
            kind: GeneratorKind::Uuid,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(uuid::Uuid::parse_str(&value).unwrap().get_version_num(), 4);
    }
}
