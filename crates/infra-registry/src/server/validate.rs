//! Request validation rules.
//!
//! Each request handler assembles the rules for its input and calls
//! [`Rules::finish`], which either passes or produces a single 400 listing
//! every offending field.

use std::collections::BTreeMap;

use infra_common::api::FieldError;

use crate::error::{Error, Result};

#[derive(Default)]
pub struct Rules {
    errors: BTreeMap<String, Vec<String>>,
}

impl Rules {
    pub fn new() -> Rules {
        Rules::default()
    }

    fn add(&mut self, field: &str, message: impl Into<String>) {
        self.errors
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn required(&mut self, field: &str, value: &str) -> &mut Self {
        if value.is_empty() {
            self.add(field, "is required");
        }
        self
    }

    /// Loose email shape check: something, an @, something with a dot.
    pub fn email(&mut self, field: &str, value: &str) -> &mut Self {
        let valid = match value.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
            }
            None => false,
        };
        if !value.is_empty() && !valid {
            self.add(field, "must be an email address");
        }
        self
    }

    pub fn min_length(&mut self, field: &str, value: &str, min: usize) -> &mut Self {
        if !value.is_empty() && value.len() < min {
            self.add(field, format!("must be at least {min} characters"));
        }
        self
    }

    pub fn finish(&mut self) -> Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        let fields = std::mem::take(&mut self.errors)
            .into_iter()
            .map(|(field, errors)| FieldError { field, errors })
            .collect();
        Err(Error::Validation(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_every_offending_field() {
        let mut rules = Rules::new();
        rules
            .required("name", "")
            .required("password", "")
            .email("name", "");
        let err = rules.finish().unwrap_err();
        match err {
            Error::Validation(fields) => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].field, "name");
                assert_eq!(fields[1].field, "password");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn email_shapes() {
        for ok in ["a@b.com", "user+tag@sub.domain.org"] {
            let mut rules = Rules::new();
            rules.email("name", ok);
            assert!(rules.finish().is_ok(), "{ok} should pass");
        }
        for bad in ["nope", "@b.com", "a@nodot", "a@.com"] {
            let mut rules = Rules::new();
            rules.email("name", bad);
            assert!(rules.finish().is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn rules_pass_on_valid_input() {
        let mut rules = Rules::new();
        rules
            .required("name", "bob@example.com")
            .email("name", "bob@example.com")
            .min_length("password", "longenough", 8);
        assert!(rules.finish().is_ok());
    }
}
