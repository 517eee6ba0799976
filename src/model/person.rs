use crate::core::{PersonId, RowVersion};
use serde::{Deserialize, Serialize};

/// Persisted column values of a `people` row, without the key.
///
/// Sessions keep one copy of this as the snapshot taken at load time and
/// compare the live record against it for change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonValues {
    pub social_security_number: Option<String>,
    pub phone_number: Option<String>,
    pub name: Option<String>,
    pub row_version: RowVersion,
}

impl PersonValues {
    /// The subset of columns the conditioned update checks.
    pub fn concurrency_values(&self) -> ConcurrencyValues {
        ConcurrencyValues {
            social_security_number: self.social_security_number.clone(),
            name: self.name.clone(),
            row_version: self.row_version,
        }
    }

    /// Renders the values for a log line, masking everything but the token
    /// unless sensitive data logging is enabled.
    pub fn log_view(&self, sensitive: bool) -> String {
        if sensitive {
            format!(
                "name={:?} phone={:?} ssn={:?} row_version={}",
                self.name, self.phone_number, self.social_security_number, self.row_version
            )
        } else {
            format!("name=*** phone=*** ssn=*** row_version={}", self.row_version)
        }
    }
}

/// Values of the concurrency-checked columns a conditioned update must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyValues {
    pub social_security_number: Option<String>,
    pub name: Option<String>,
    pub row_version: RowVersion,
}

/// The `Person` record.
///
/// `name`, `social_security_number` and `row_version` are concurrency
/// checked. The row version is ordinary data here: callers can overwrite it,
/// and it is up to the session's token policy whether that value is ever
/// used as the concurrency witness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Person {
    id: Option<PersonId>,
    values: PersonValues,
}

impl Person {
    /// Creates a transient record with a freshly generated row version.
    pub fn new(name: &str, phone_number: &str, social_security_number: &str) -> Self {
        Self {
            id: None,
            values: PersonValues {
                social_security_number: Some(social_security_number.to_string()),
                phone_number: Some(phone_number.to_string()),
                name: Some(name.to_string()),
                row_version: RowVersion::generate(),
            },
        }
    }

    pub(crate) fn from_parts(id: PersonId, values: PersonValues) -> Self {
        Self {
            id: Some(id),
            values,
        }
    }

    pub fn id(&self) -> Option<PersonId> {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: PersonId) {
        self.id = Some(id);
    }

    pub fn name(&self) -> Option<&str> {
        self.values.name.as_deref()
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.values.phone_number.as_deref()
    }

    pub fn social_security_number(&self) -> Option<&str> {
        self.values.social_security_number.as_deref()
    }

    pub fn row_version(&self) -> RowVersion {
        self.values.row_version
    }

    pub fn values(&self) -> &PersonValues {
        &self.values
    }

    pub(crate) fn replace_values(&mut self, values: PersonValues) {
        self.values = values;
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.values.name = Some(name.into());
    }

    pub fn set_phone_number(&mut self, phone_number: impl Into<String>) {
        self.values.phone_number = Some(phone_number.into());
    }

    /// Overwrites the row version held by this record.
    pub fn set_row_version(&mut self, row_version: RowVersion) {
        self.values.row_version = row_version;
    }

    /// Builds the values to write for a save, with a fresh token.
    pub(crate) fn next_values(&self, row_version: RowVersion) -> PersonValues {
        PersonValues {
            row_version,
            ..self.values.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_person_is_transient() {
        let person = Person::new("John Doe", "555-555-5555", "123-45-6789");
        assert!(person.id().is_none());
        assert_eq!(person.name(), Some("John Doe"));
        assert_eq!(person.phone_number(), Some("555-555-5555"));
        assert_eq!(person.social_security_number(), Some("123-45-6789"));
        assert_ne!(person.row_version(), RowVersion::nil());
    }

    #[test]
    fn test_next_values_only_swaps_token() {
        let person = Person::new("John Doe", "555-555-5555", "123-45-6789");
        let token = RowVersion::generate();
        let next = person.next_values(token);

        assert_eq!(next.row_version, token);
        assert_eq!(next.name, person.values().name);
        assert_eq!(next.phone_number, person.values().phone_number);
    }

    #[test]
    fn test_log_view_redacts_by_default() {
        let person = Person::new("John Doe", "555-555-5555", "123-45-6789");
        let hidden = person.values().log_view(false);
        assert!(!hidden.contains("John"));
        assert!(!hidden.contains("123-45-6789"));
        assert!(hidden.contains(&person.row_version().to_string()));

        let shown = person.values().log_view(true);
        assert!(shown.contains("John Doe"));
    }

    #[test]
    fn test_concurrency_values_exclude_phone() {
        let mut person = Person::new("John Doe", "555-555-5555", "123-45-6789");
        let before = person.values().concurrency_values();
        person.set_phone_number("555-555-5556");
        assert_eq!(person.values().concurrency_values(), before);

        person.set_name("Jane Doe");
        assert_ne!(person.values().concurrency_values(), before);
    }
}
