//! # Config
//!
//! The in-memory configuration model of a pump: section and field definitions declared by a pump
//! type, and the current values of every subsection.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ConfigError;
use crate::events::LogLevel;
use crate::validation::{BlockingValidator, SectionValidator, Validation};

/// The current values of one subsection, keyed by field name.
pub type FieldValues = BTreeMap<String, Value>;

/// The persisted shape of a pump's configuration: values of every subsection, keyed by section name.
pub type ConfigState = BTreeMap<String, Vec<FieldValues>>;

/// Name of the section every pump type gets in front of its own sections.
pub const PUMP_SECTION: &str = "Pump";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Int,
    Float,
    Bool,
    Choice,
    Directory,
}

impl FieldKind {
    /// Value a field takes when its definition does not declare a default.
    fn default_value(&self) -> Value {
        match self {
            FieldKind::String | FieldKind::Choice | FieldKind::Directory => Value::from(""),
            FieldKind::Int => Value::from(0),
            FieldKind::Float => Value::from(0.0),
            FieldKind::Bool => Value::from(false),
        }
    }
}

/// Source of the choices of a `Choice` field that can only be listed once the sections it depends on
/// are valid, e.g. the unit names known to a server.
#[async_trait]
pub trait ChoiceProvider: Send + Sync {
    async fn choices(&self, state: ConfigState) -> Result<Vec<String>, String>;
}

#[derive(Clone)]
pub struct DynamicChoices(pub Arc<dyn ChoiceProvider>);

impl fmt::Debug for DynamicChoices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DynamicChoices")
    }
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub readonly: bool,
    pub default: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Accepted values of a `Choice` field. Empty means anything goes, which is the case for dynamic
    /// choices until they are first listed.
    pub choices: Vec<String>,
    pub dynamic_choices: Option<DynamicChoices>,
    /// Shown next to the field by a frontend.
    pub help: Option<String>,
}

impl FieldDef {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            required: false,
            readonly: false,
            default: None,
            min: None,
            max: None,
            choices: Vec::new(),
            dynamic_choices: None,
            help: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn choices(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|c| (*c).to_owned()).collect();
        self
    }

    /// Refresh the choices of this field from `provider` whenever its section is validated with every
    /// dependency valid.
    pub fn choices_from(mut self, provider: impl ChoiceProvider + 'static) -> Self {
        self.dynamic_choices = Some(DynamicChoices(Arc::new(provider)));
        self
    }

    pub fn help(mut self, help: &str) -> Self {
        self.help = Some(help.to_owned());
        self
    }

    /// Whether `value` leaves a required field unset.
    pub fn is_missing(&self, value: Option<&Value>) -> bool {
        self.required
            && match value {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            }
    }

    pub fn initial_value(&self) -> Value {
        self.default
            .clone()
            .unwrap_or_else(|| self.kind.default_value())
    }

    /// Field level check run before an edit is accepted.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        match self.kind {
            FieldKind::Bool if !value.is_boolean() => Err("expected true or false".to_owned()),
            FieldKind::Int if !(value.is_i64() || value.is_u64()) => {
                Err("expected an integer".to_owned())
            }
            FieldKind::Float if !value.is_number() => Err("expected a number".to_owned()),
            FieldKind::String | FieldKind::Directory if !value.is_string() => {
                Err("expected a string".to_owned())
            }
            FieldKind::Choice => match value.as_str() {
                None => Err("expected a string".to_owned()),
                Some(choice) if !self.choices.is_empty() && !self.choices.iter().any(|c| c == choice) => {
                    Err(format!("{choice} is not one of {}", self.choices.join(", ")))
                }
                Some(_) => Ok(()),
            },
            FieldKind::Int | FieldKind::Float => self.check_range(value),
            _ => Ok(()),
        }
    }

    fn check_range(&self, value: &Value) -> Result<(), String> {
        let Some(number) = value.as_f64() else {
            return Ok(());
        };
        let below = self.min.is_some_and(|min| number < min);
        let above = self.max.is_some_and(|max| number > max);
        if below || above {
            return Err(format!(
                "{number} is outside [{}, {}]",
                self.min.map_or("-inf".to_owned(), |m| m.to_string()),
                self.max.map_or("inf".to_owned(), |m| m.to_string()),
            ));
        }
        Ok(())
    }
}

/// A named, independently validatable group of configuration fields.
#[derive(Clone)]
pub struct SectionDef {
    pub name: String,
    pub multiple: bool,
    pub fields: Vec<FieldDef>,
    pub dependencies: Vec<String>,
    pub validator: Option<Arc<dyn SectionValidator>>,
}

impl fmt::Debug for SectionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionDef")
            .field("name", &self.name)
            .field("multiple", &self.multiple)
            .field("fields", &self.fields)
            .field("dependencies", &self.dependencies)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl SectionDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            multiple: false,
            fields: Vec::new(),
            dependencies: Vec::new(),
            validator: None,
        }
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn depends_on(mut self, section: &str) -> Self {
        self.dependencies.push(section.to_owned());
        self
    }

    pub fn validator(mut self, validator: impl SectionValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Validate with a synchronous check, run off the async worker threads.
    pub fn blocking_validator<F>(self, check: F) -> Self
    where
        F: Fn(&[FieldValues]) -> Validation + Send + Sync + 'static,
    {
        self.validator(BlockingValidator::new(check))
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn default_subsection(&self) -> FieldValues {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.initial_value()))
            .collect()
    }
}

/// The options every pump has regardless of its type.
pub fn pump_section() -> SectionDef {
    SectionDef::new(PUMP_SECTION)
        .field(FieldDef::new("type", FieldKind::String).required().readonly())
        .field(FieldDef::new("name", FieldKind::String).required().readonly())
        .field(
            FieldDef::new("interval (s)", FieldKind::Int)
                .required()
                .default(300)
                .range(1.0, 86400.0)
                .help("Enter how often this Pump should run in seconds."),
        )
        .field(
            FieldDef::new("log level", FieldKind::Choice)
                .default("info")
                .choices(&["debug", "info", "warning", "error", "critical"]),
        )
        .field(
            FieldDef::new("active", FieldKind::Bool)
                .default(true)
                .help("Enable or disable this Pump"),
        )
}

/// Section definitions of one pump together with the current value of every field.
///
/// Values are only changed through `apply_edit`, `add_subsection` and `remove_subsection`; callers
/// sharing a `PumpConfig` between tasks must serialize those calls.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    sections: Vec<SectionDef>,
    state: ConfigState,
}

impl PumpConfig {
    /// Build the default configuration of a pump of `pump_type` named `name`.
    pub fn new(pump_type: &str, name: &str, sections: Vec<SectionDef>) -> Self {
        let sections: Vec<SectionDef> = std::iter::once(pump_section()).chain(sections).collect();
        let state = sections
            .iter()
            .map(|s| (s.name.clone(), vec![s.default_subsection()]))
            .collect();

        let mut config = Self { sections, state };
        config.set_identity(pump_type, name);
        config
    }

    fn set_identity(&mut self, pump_type: &str, name: &str) {
        if let Some(pump) = self.state.get_mut(PUMP_SECTION).and_then(|s| s.first_mut()) {
            pump.insert("type".to_owned(), Value::from(pump_type));
            pump.insert("name".to_owned(), Value::from(name));
        }
    }

    /// Merge a previously saved state over the current one. Saved sections or fields that no longer
    /// exist are ignored, and fields missing from the saved state keep their current value. A section
    /// that does not allow multiple subsections always keeps exactly one.
    pub fn merge_saved(&mut self, saved: &ConfigState) {
        let (pump_type, name) = (self.pump_type(), self.name());

        for section in &self.sections {
            let Some(saved_subsections) = saved.get(&section.name) else {
                continue;
            };
            let Some(current) = self.state.get_mut(&section.name) else {
                continue;
            };

            let template = current
                .first()
                .cloned()
                .unwrap_or_else(|| section.default_subsection());
            let count = if section.multiple {
                saved_subsections.len()
            } else {
                1
            };

            *current = (0..count)
                .map(|idx| {
                    let mut subsection = template.clone();
                    if let Some(saved_values) = saved_subsections.get(idx) {
                        for (field, value) in subsection.iter_mut() {
                            if let Some(saved_value) = saved_values.get(field) {
                                *value = saved_value.clone();
                            }
                        }
                    }
                    subsection
                })
                .collect();
        }

        self.set_identity(&pump_type, &name);
    }

    /// Set one field of one subsection. Returns `Ok(false)` when the value is unchanged, in which case
    /// nothing needs revalidating.
    pub fn apply_edit(
        &mut self,
        section: &str,
        index: usize,
        field: &str,
        value: Value,
    ) -> Result<bool, ConfigError> {
        let def = self
            .section(section)
            .ok_or_else(|| ConfigError::UnknownSection(section.to_owned()))?;
        let field_def = def.field_def(field).ok_or_else(|| ConfigError::UnknownField {
            section: section.to_owned(),
            field: field.to_owned(),
        })?;

        let invalid = |reason: String| ConfigError::InvalidValue {
            section: section.to_owned(),
            field: field.to_owned(),
            reason,
        };
        if field_def.readonly {
            return Err(invalid("field is read only".to_owned()));
        }
        field_def.check(&value).map_err(invalid)?;

        let subsection = self
            .state
            .get_mut(section)
            .and_then(|subsections| subsections.get_mut(index))
            .ok_or_else(|| ConfigError::SubsectionOutOfRange {
                section: section.to_owned(),
                index,
            })?;

        if subsection.get(field) == Some(&value) {
            return Ok(false);
        }
        subsection.insert(field.to_owned(), value);
        Ok(true)
    }

    /// Append a subsection with default values to a `multiple` section, returning its index.
    pub fn add_subsection(&mut self, section: &str) -> Result<usize, ConfigError> {
        let def = self
            .section(section)
            .ok_or_else(|| ConfigError::UnknownSection(section.to_owned()))?;
        if !def.multiple {
            return Err(ConfigError::NotMultiple(section.to_owned()));
        }
        let subsection = def.default_subsection();

        let subsections = self.state.entry(section.to_owned()).or_default();
        subsections.push(subsection);
        Ok(subsections.len() - 1)
    }

    pub fn remove_subsection(&mut self, section: &str, index: usize) -> Result<(), ConfigError> {
        let def = self
            .section(section)
            .ok_or_else(|| ConfigError::UnknownSection(section.to_owned()))?;
        if !def.multiple {
            return Err(ConfigError::NotMultiple(section.to_owned()));
        }

        let subsections = self.state.entry(section.to_owned()).or_default();
        if index >= subsections.len() {
            return Err(ConfigError::SubsectionOutOfRange {
                section: section.to_owned(),
                index,
            });
        }
        if subsections.len() == 1 {
            return Err(ConfigError::LastSubsection(section.to_owned()));
        }
        subsections.remove(index);
        Ok(())
    }

    /// Replace the choices of a `Choice` field, e.g. after listing them from a server.
    pub fn set_choices(
        &mut self,
        section: &str,
        field: &str,
        choices: Vec<String>,
    ) -> Result<(), ConfigError> {
        let def = self
            .sections
            .iter_mut()
            .find(|s| s.name == section)
            .ok_or_else(|| ConfigError::UnknownSection(section.to_owned()))?;
        let field_def = def
            .fields
            .iter_mut()
            .find(|f| f.name == field)
            .ok_or_else(|| ConfigError::UnknownField {
                section: section.to_owned(),
                field: field.to_owned(),
            })?;

        field_def.choices = choices;
        Ok(())
    }

    /// Checks every section gets before its validator runs: required fields are set and choice fields
    /// hold one of their current choices.
    pub fn check_section(&self, section: &str) -> Result<(), String> {
        let Some(def) = self.section(section) else {
            return Err(format!("unknown section {section}"));
        };

        for values in self.state.get(section).into_iter().flatten() {
            for field in &def.fields {
                let value = values.get(&field.name);
                if field.is_missing(value) {
                    return Err(format!("You must set a {}", field.name));
                }
                if field.kind != FieldKind::Choice || field.choices.is_empty() {
                    continue;
                }
                match value.and_then(Value::as_str) {
                    Some(choice) if !choice.is_empty() && !field.choices.iter().any(|c| c == choice) => {
                        return Err(format!("{choice} is not a valid {}", field.name));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    pub fn sections(&self) -> &[SectionDef] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&SectionDef> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Section name to declared dependencies, the input of a `DependencyGraph`.
    pub fn dependency_map(&self) -> Vec<(String, Vec<String>)> {
        self.sections
            .iter()
            .map(|s| (s.name.clone(), s.dependencies.clone()))
            .collect()
    }

    /// Values of every subsection of `section`; empty for an unknown section.
    pub fn values(&self, section: &str) -> Vec<FieldValues> {
        self.state.get(section).cloned().unwrap_or_default()
    }

    /// Value of `field` in the first subsection of `section`.
    pub fn value(&self, section: &str, field: &str) -> Option<&Value> {
        self.state.get(section)?.first()?.get(field)
    }

    pub fn state(&self) -> &ConfigState {
        &self.state
    }

    pub fn pump_type(&self) -> String {
        self.str_value(PUMP_SECTION, "type").to_owned()
    }

    pub fn name(&self) -> String {
        self.str_value(PUMP_SECTION, "name").to_owned()
    }

    pub fn interval(&self) -> Duration {
        let seconds = self
            .value(PUMP_SECTION, "interval (s)")
            .and_then(Value::as_u64)
            .unwrap_or(300)
            .max(1);
        Duration::from_secs(seconds)
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_setting(self.str_value(PUMP_SECTION, "log level"))
    }

    pub fn active(&self) -> bool {
        self.value(PUMP_SECTION, "active")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn str_value(&self, section: &str, field: &str) -> &str {
        self.value(section, field)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// Typed accessors for the values of one subsection.
pub trait FieldValuesExt {
    fn str_field(&self, field: &str) -> &str;
    fn f64_field(&self, field: &str) -> Option<f64>;
    fn i64_field(&self, field: &str) -> Option<i64>;
    fn bool_field(&self, field: &str) -> Option<bool>;
}

impl FieldValuesExt for FieldValues {
    fn str_field(&self, field: &str) -> &str {
        self.get(field).and_then(Value::as_str).unwrap_or_default()
    }

    fn f64_field(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    fn i64_field(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    fn bool_field(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }
}
