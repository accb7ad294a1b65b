//! Fluent construction of tool parameter schemas.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// One parameter. `items` applies to arrays, `properties` to objects;
/// both nest to any depth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub kind: ParameterType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Parameter>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<Parameter>,
}

impl Parameter {
    fn of(kind: ParameterType, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: false,
            items: None,
            properties: Vec::new(),
        }
    }

    pub fn string(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::of(ParameterType::String, name, description)
    }

    pub fn number(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::of(ParameterType::Number, name, description)
    }

    pub fn boolean(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::of(ParameterType::Boolean, name, description)
    }

    pub fn array(name: impl Into<String>, description: impl Into<String>, items: Parameter) -> Self {
        let mut param = Self::of(ParameterType::Array, name, description);
        param.items = Some(Box::new(items));
        param
    }

    pub fn object(
        name: impl Into<String>,
        description: impl Into<String>,
        properties: Vec<Parameter>,
    ) -> Self {
        let mut param = Self::of(ParameterType::Object, name, description);
        param.properties = properties;
        param
    }

    /// Item schema for arrays of scalars; the name is unused.
    pub fn item(kind: ParameterType) -> Self {
        Self::of(kind, "", "")
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn to_json_schema(&self) -> Value {
        let mut schema = Map::new();
        schema.insert("type".into(), json!(self.kind.as_str()));
        if !self.description.is_empty() {
            schema.insert("description".into(), json!(self.description));
        }
        match self.kind {
            ParameterType::Array => {
                if let Some(items) = &self.items {
                    schema.insert("items".into(), items.to_json_schema());
                }
            }
            ParameterType::Object => {
                let (properties, required) = object_members(&self.properties);
                schema.insert("properties".into(), properties);
                if !required.is_empty() {
                    schema.insert("required".into(), json!(required));
                }
            }
            _ => {}
        }
        Value::Object(schema)
    }
}

fn object_members(params: &[Parameter]) -> (Value, Vec<String>) {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in params {
        properties.insert(param.name.clone(), param.to_json_schema());
        if param.required {
            required.push(param.name.clone());
        }
    }
    (Value::Object(properties), required)
}

/// Built tool description, independent of any provider's wire shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<Parameter>,
}

impl ToolSpec {
    /// Top-level object schema. `required` is always present at the root.
    pub fn parameters_schema(&self) -> Value {
        let (properties, required) = object_members(&self.parameters);
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// OpenAI Responses `function` tool.
    pub fn to_openai(&self) -> Value {
        json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters_schema(),
        })
    }

    /// Anthropic Messages tool with `input_schema`.
    pub fn to_anthropic(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.parameters_schema(),
        })
    }
}

pub struct ToolBuilder {
    spec: ToolSpec,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            spec: ToolSpec {
                name: name.into(),
                description: description.into(),
                parameters: Vec::new(),
            },
        }
    }

    pub fn param(mut self, param: Parameter) -> Self {
        self.spec.parameters.push(param);
        self
    }

    pub fn string(self, name: &str, description: &str, required: bool) -> Self {
        self.param(with_required(Parameter::string(name, description), required))
    }

    pub fn number(self, name: &str, description: &str, required: bool) -> Self {
        self.param(with_required(Parameter::number(name, description), required))
    }

    pub fn boolean(self, name: &str, description: &str, required: bool) -> Self {
        self.param(with_required(Parameter::boolean(name, description), required))
    }

    pub fn array(self, name: &str, description: &str, required: bool, items: Parameter) -> Self {
        self.param(with_required(Parameter::array(name, description, items), required))
    }

    pub fn object(
        self,
        name: &str,
        description: &str,
        required: bool,
        properties: Vec<Parameter>,
    ) -> Self {
        self.param(with_required(
            Parameter::object(name, description, properties),
            required,
        ))
    }

    pub fn build(self) -> ToolSpec {
        self.spec
    }
}

fn with_required(param: Parameter, required: bool) -> Parameter {
    if required { param.required() } else { param }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_tool() -> ToolSpec {
        ToolBuilder::new("search", "Search documents")
            .string("query", "Search text", true)
            .number("limit", "Max results", false)
            .boolean("exact", "", false)
            .array("tags", "Filter tags", false, Parameter::item(ParameterType::String))
            .object(
                "filter",
                "Structured filter",
                true,
                vec![
                    Parameter::string("field", "Field name").required(),
                    Parameter::object(
                        "range",
                        "",
                        vec![
                            Parameter::number("min", "").required(),
                            Parameter::number("max", ""),
                        ],
                    ),
                ],
            )
            .build()
    }

    #[test]
    fn root_required_tracks_flags() {
        let schema = search_tool().parameters_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["query", "filter"]));
        assert_eq!(schema["properties"]["limit"]["type"], "number");
        assert!(schema["properties"]["exact"].get("description").is_none());
    }

    #[test]
    fn root_required_present_when_empty() {
        let spec = ToolBuilder::new("ping", "").build();
        assert_eq!(spec.parameters_schema()["required"], json!([]));
    }

    #[test]
    fn nested_object_required_at_every_depth() {
        let schema = search_tool().parameters_schema();
        let filter = &schema["properties"]["filter"];
        assert_eq!(filter["required"], json!(["field"]));
        let range = &filter["properties"]["range"];
        assert_eq!(range["required"], json!(["min"]));
        assert_eq!(range["properties"]["max"]["type"], "number");
    }

    #[test]
    fn nested_object_omits_empty_required() {
        let p = Parameter::object("o", "", vec![Parameter::string("a", "")]);
        assert!(p.to_json_schema().get("required").is_none());
    }

    #[test]
    fn array_items_schema() {
        let schema = search_tool().parameters_schema();
        assert_eq!(schema["properties"]["tags"]["items"], json!({"type": "string"}));
    }

    #[test]
    fn array_of_objects() {
        let p = Parameter::array(
            "edits",
            "",
            Parameter::object("", "", vec![Parameter::string("path", "").required()]),
        );
        let schema = p.to_json_schema();
        assert_eq!(schema["items"]["type"], "object");
        assert_eq!(schema["items"]["required"], json!(["path"]));
    }

    #[test]
    fn openai_and_anthropic_shapes() {
        let spec = search_tool();
        let openai = spec.to_openai();
        assert_eq!(openai["type"], "function");
        assert_eq!(openai["name"], "search");
        assert_eq!(openai["parameters"], spec.parameters_schema());

        let anthropic = spec.to_anthropic();
        assert_eq!(anthropic["name"], "search");
        assert_eq!(anthropic["input_schema"], spec.parameters_schema());
        assert!(anthropic.get("type").is_none());
    }
}
