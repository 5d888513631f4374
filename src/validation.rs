// Pure form validation.
//
// Rules run in a fixed order (required, max_length, pattern, custom) and
// the first failure wins. The cross-field password confirmation check
// goes through the `custom` hook with the whole form as context.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

pub static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern"));

pub static PHONE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9][0-9\s\-()]{6,19}$").expect("phone pattern"));

static PASSWORD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.{8,}$").expect("password pattern"));

pub type FormContext = HashMap<String, String>;

type CustomRule = fn(&str, &FormContext) -> Option<String>;

#[derive(Clone, Copy, Default)]
pub struct FieldRules {
    pub required: bool,
    pub max_length: Option<usize>,
    pub pattern: Option<&'static Lazy<Regex>>,
    pub pattern_message: &'static str,
    pub custom: Option<CustomRule>,
}

/// Validates one field against its rules; `None` means valid.
pub fn validate_field(
    value: &str,
    rules: &FieldRules,
    form: &FormContext,
) -> Option<String> {
    let trimmed = value.trim();

    if rules.required && trimmed.is_empty() {
        return Some("This field is required".to_string());
    }
    if trimmed.is_empty() {
        return None;
    }
    if let Some(max) = rules.max_length {
        if trimmed.chars().count() > max {
            return Some(format!("Must be at most {max} characters"));
        }
    }
    if let Some(pattern) = rules.pattern {
        if !pattern.is_match(trimmed) {
            return Some(rules.pattern_message.to_string());
        }
    }
    if let Some(custom) = rules.custom {
        return custom(trimmed, form);
    }
    None
}

fn passwords_match(value: &str, form: &FormContext) -> Option<String> {
    let password = form.get("password").map(String::as_str).unwrap_or("");
    if value != password {
        return Some("Passwords do not match".to_string());
    }
    None
}

/// Rule table for the registration form.
pub fn register_rules(field: &str) -> Option<FieldRules> {
    let rules = match field {
        "name" | "surname" => FieldRules {
            required: true,
            max_length: Some(50),
            ..FieldRules::default()
        },
        "middle_name" => FieldRules {
            max_length: Some(50),
            ..FieldRules::default()
        },
        "phone" => FieldRules {
            required: true,
            pattern: Some(&PHONE_PATTERN),
            pattern_message: "Enter a valid phone number",
            ..FieldRules::default()
        },
        "email" => FieldRules {
            required: true,
            max_length: Some(254),
            pattern: Some(&EMAIL_PATTERN),
            pattern_message: "Enter a valid email address",
            ..FieldRules::default()
        },
        "country" => FieldRules {
            required: true,
            ..FieldRules::default()
        },
        "password" => FieldRules {
            required: true,
            pattern: Some(&PASSWORD_PATTERN),
            pattern_message: "Password must be at least 8 characters",
            ..FieldRules::default()
        },
        "password_confirmation" => FieldRules {
            required: true,
            custom: Some(passwords_match),
            ..FieldRules::default()
        },
        _ => return None,
    };
    Some(rules)
}

const REGISTER_FIELDS: &[&str] = &[
    "name",
    "surname",
    "middle_name",
    "phone",
    "email",
    "country",
    "password",
    "password_confirmation",
];

/// Runs every registration field and collects a field -> message map.
/// The terms-agreement flag is required on top of the field rules.
pub fn validate_register_form(form: &FormContext, agree_terms: bool) -> HashMap<String, String> {
    let mut errors = HashMap::new();
    for field in REGISTER_FIELDS {
        let rules = match register_rules(field) {
            Some(rules) => rules,
            None => continue,
        };
        let value = form.get(*field).map(String::as_str).unwrap_or("");
        if let Some(message) = validate_field(value, &rules, form) {
            errors.insert((*field).to_string(), message);
        }
    }
    if !agree_terms {
        errors.insert(
            "agree_terms".to_string(),
            "You must accept the terms and conditions".to_string(),
        );
    }
    errors
}
