//! Per-type metadata the planner needs without talking to a provider.

use crate::error::ValidationError;
use crate::model::Attributes;

/// How a change to an attribute is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// The provider can change the attribute on the existing object.
    UpdateInPlace,
    /// Changing the attribute requires a new object.
    ReplaceOnly,
}

/// Static description of a resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSchema {
    /// Type tag, e.g. `network`.
    pub type_name: String,
    /// Attributes that must be declared.
    pub required: Vec<String>,
    /// Attributes whose change forces replacement.
    pub replace_only: Vec<String>,
    /// Outputs the provider returns.
    pub outputs: Vec<String>,
    /// Whether replacement creates the new object before deleting the old.
    pub create_before_destroy: bool,
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

impl TypeSchema {
    /// Creates a schema with no constraints.
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            required: Vec::new(),
            replace_only: Vec::new(),
            outputs: vec![String::from("id")],
            create_before_destroy: false,
        }
    }

    /// Sets the required attributes.
    #[must_use]
    pub fn required(mut self, names: &[&str]) -> Self {
        self.required = owned(names);
        self
    }

    /// Sets the replace-only attributes.
    #[must_use]
    pub fn replace_only(mut self, names: &[&str]) -> Self {
        self.replace_only = owned(names);
        self
    }

    /// Sets the outputs.
    #[must_use]
    pub fn outputs(mut self, names: &[&str]) -> Self {
        self.outputs = owned(names);
        self
    }

    /// Sets the replacement ordering.
    #[must_use]
    pub const fn create_before_destroy(mut self, enabled: bool) -> Self {
        self.create_before_destroy = enabled;
        self
    }

    /// Returns how a change to `attribute` is applied.
    #[must_use]
    pub fn mutability(&self, attribute: &str) -> Mutability {
        if self.replace_only.iter().any(|a| a == attribute) {
            Mutability::ReplaceOnly
        } else {
            Mutability::UpdateInPlace
        }
    }

    /// Returns true if changing any of `changed` forces replacement.
    #[must_use]
    pub fn requires_replacement<S: AsRef<str>>(&self, changed: &[S]) -> bool {
        changed
            .iter()
            .any(|a| self.mutability(a.as_ref()) == Mutability::ReplaceOnly)
    }

    /// Checks that every required attribute is declared.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the missing attributes.
    pub fn check_required(
        &self,
        resource: &str,
        attributes: &Attributes,
    ) -> Result<(), ValidationError> {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|name| !attributes.contains_key(name.as_str()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(
                resource,
                format!(
                    "missing required attribute(s) for {}: {}",
                    self.type_name,
                    missing.join(", ")
                ),
            ))
        }
    }
}
