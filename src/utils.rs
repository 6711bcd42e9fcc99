use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, SecondsFormat, Utc};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::errors::AppError;

const MIN_PASSWORD_LENGTH: usize = 8;

pub fn hash_password(password: &str) -> Result<String, AppError> {
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err(AppError::bad_request(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AppError::internal(format!("failed to hash password: {err}")))
}

pub fn verify_password(password: &str, password_hash: &str) -> Result<bool, AppError> {
    let parsed_hash = PasswordHash::new(password_hash)
        .map_err(|err| AppError::internal(format!("invalid password hash: {err}")))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Canonical TEXT form for timestamps: fixed-width so SQL string comparison orders correctly.
pub fn db_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

const SLUG_MIN: usize = 2;
const SLUG_MAX: usize = 63;

/// Lowercase ASCII alphanumerics separated by single hyphens.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }

    slug.truncate(SLUG_MAX);
    slug.trim_end_matches('-').to_string()
}

pub fn validate_slug(slug: &str) -> Result<(), AppError> {
    let well_formed = (SLUG_MIN..=SLUG_MAX).contains(&slug.len())
        && slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && !slug.contains("--");

    if well_formed {
        Ok(())
    } else {
        Err(AppError::bad_request(format!(
            "slug must be {}-{} lowercase letters, digits or single hyphens",
            SLUG_MIN, SLUG_MAX
        )))
    }
}

/// Random 256-bit token, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Acme Consulting Ltd."), "acme-consulting-ltd");
        assert_eq!(slugify("  --Über  Vendors 2025 "), "ber-vendors-2025");
        assert!(validate_slug(&slugify("Acme Consulting Ltd.")).is_ok());
    }

    #[test]
    fn validate_slug_rejects_malformed() {
        assert!(validate_slug("a").is_err());
        assert!(validate_slug("Acme").is_err());
        assert!(validate_slug("acme--corp").is_err());
        assert!(validate_slug("-acme").is_err());
        assert!(validate_slug("acme-corp").is_ok());
    }

    #[test]
    fn db_time_is_fixed_width() {
        let a = db_time(Utc::now());
        let b = db_time(Utc::now() + chrono::Duration::hours(1));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }

    #[test]
    fn token_hash_is_stable() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert_eq!(hash_token(&token), hash_token(&token));
        assert_ne!(hash_token(&token), token);
    }
}
