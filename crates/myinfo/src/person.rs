use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smol_str::SmolStr;

/// One attribute of a person record, e.g. `name` or `nationality`.
///
/// Free-text attributes carry `value`; coded ones carry `code` and `desc`.
/// Structured attributes (addresses, lists) keep their remaining fields in
/// `other`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct PersonAttribute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastupdated: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailable: Option<bool>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl PersonAttribute {
    /// `value` when it is a string.
    pub fn value_str(&self) -> Option<&str> {
        self.value.as_ref().and_then(Value::as_str)
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.unwrap_or(false)
    }

    /// Best human readable form: `value`, else `desc`, else `code`.
    pub fn display_value(&self) -> Option<SmolStr> {
        match &self.value {
            Some(Value::String(s)) => Some(s.as_str().into()),
            Some(Value::Null) | None => self.desc.clone().or_else(|| self.code.clone()),
            Some(other) => Some(smol_str::format_smolstr!("{other}")),
        }
    }
}

/// Person record returned by `person/{uinfin}/`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(transparent)]
pub struct Person(pub Map<String, Value>);

impl Person {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn as_json(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Decoded attribute, or `None` when absent or not an attribute object.
    pub fn attribute(&self, name: &str) -> Option<PersonAttribute> {
        match self.0.get(name)? {
            value @ Value::Object(_) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<PersonAttribute> {
        self.attribute("name")
    }

    pub fn dob(&self) -> Option<PersonAttribute> {
        self.attribute("dob")
    }

    pub fn sex(&self) -> Option<PersonAttribute> {
        self.attribute("sex")
    }

    pub fn nationality(&self) -> Option<PersonAttribute> {
        self.attribute("nationality")
    }

    /// NRIC/FIN of the person, when included.
    pub fn uinfin(&self) -> Option<SmolStr> {
        self.attribute("uinfin")
            .and_then(|a| a.value_str().map(SmolStr::from))
    }
}
