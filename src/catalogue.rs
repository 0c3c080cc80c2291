use anyhow::{Context, Result};
use quick_xml::Reader;
use quick_xml::events::Event;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Which handler executes a selected tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolHandlerKind {
    Search,
    ItemDetails,
    CompareItems,
    Ensemble,
    Statistics,
    GenerateAnswer,
}

impl ToolHandlerKind {
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "item_details" => ToolHandlerKind::ItemDetails,
            "compare_items" => ToolHandlerKind::CompareItems,
            "ensemble" => ToolHandlerKind::Ensemble,
            "statistics" => ToolHandlerKind::Statistics,
            "generate_answer" => ToolHandlerKind::GenerateAnswer,
            _ => ToolHandlerKind::Search,
        }
    }
}

/// One declared tool: scoring prompt, argument spec, and the handler that
/// runs when it wins routing.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub schema_type: String,
    pub arguments: BTreeMap<String, String>,
    pub examples: Vec<String>,
    pub prompt: String,
    /// JSON schema of the scoring reply; must include a numeric `score`.
    pub return_structure: Value,
    pub handler: ToolHandlerKind,
}

/// Process-wide tool catalogue. Inheritance is resolved at load time by
/// materialising the effective toolset per schema type: a type sees its
/// own tools plus `Thing` tools, with type-specific names overriding.
/// Immutable after load; per-request selection reads it without
/// synchronisation.
pub struct ToolCatalogue {
    effective: HashMap<String, Vec<Arc<ToolDescriptor>>>,
}

impl ToolCatalogue {
    pub fn empty() -> Self {
        Self {
            effective: HashMap::new(),
        }
    }

    /// Load and materialise the catalogue from `tools.xml`. A missing
    /// file degrades to an empty catalogue (plain search still works).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            warn!(path = %path.display(), "tool catalogue not found, routing will default to search");
            return Ok(Self::empty());
        }
        let xml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let by_type = parse_tools_xml(&xml)?;
        let catalogue = Self::materialise(by_type);
        info!(
            schema_types = catalogue.effective.len(),
            "tool catalogue loaded"
        );
        Ok(catalogue)
    }

    pub fn from_xml(xml: &str) -> Result<Self> {
        Ok(Self::materialise(parse_tools_xml(xml)?))
    }

    fn materialise(by_type: HashMap<String, Vec<ToolDescriptor>>) -> Self {
        let thing: BTreeMap<String, Arc<ToolDescriptor>> = by_type
            .get("Thing")
            .map(|tools| {
                tools
                    .iter()
                    .map(|t| (t.name.clone(), Arc::new(t.clone())))
                    .collect()
            })
            .unwrap_or_default();

        let mut effective = HashMap::new();
        for (schema_type, tools) in &by_type {
            let mut merged = thing.clone();
            for tool in tools {
                merged.insert(tool.name.clone(), Arc::new(tool.clone()));
            }
            effective.insert(schema_type.clone(), merged.into_values().collect());
        }
        if !thing.is_empty() {
            effective
                .entry("Thing".to_string())
                .or_insert_with(|| thing.values().cloned().collect());
        }
        Self { effective }
    }

    /// Effective toolset for a schema type; unknown types see the `Thing`
    /// tools.
    pub fn tools_for_type(&self, schema_type: &str) -> Vec<Arc<ToolDescriptor>> {
        self.effective
            .get(schema_type)
            .or_else(|| self.effective.get("Thing"))
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.effective.is_empty()
    }
}

/// Parse the `<Tools><SchemaType><Tool …/></SchemaType></Tools>` format.
/// Disabled tools (`enabled="false"`) are skipped.
fn parse_tools_xml(xml: &str) -> Result<HashMap<String, Vec<ToolDescriptor>>> {
    let mut reader = Reader::from_str(xml);
    let mut by_type: HashMap<String, Vec<ToolDescriptor>> = HashMap::new();

    let mut depth = 0usize;
    let mut schema_type = String::new();
    let mut tool: Option<PendingTool> = None;
    let mut field: Option<String> = None;
    let mut arg_name = String::new();
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match depth {
                    2 => schema_type = tag,
                    3 if tag == "Tool" => {
                        let mut pending = PendingTool::default();
                        for attr in e.attributes().flatten() {
                            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                            let value = attr
                                .unescape_value()
                                .map(|v| v.into_owned())
                                .unwrap_or_default();
                            match key.as_str() {
                                "name" => pending.name = value,
                                "enabled" => pending.enabled = !value.eq_ignore_ascii_case("false"),
                                _ => {}
                            }
                        }
                        tool = Some(pending);
                    }
                    4 => {
                        field = Some(tag.clone());
                        text.clear();
                        if tag == "argument" {
                            arg_name.clear();
                            for attr in e.attributes().flatten() {
                                if attr.key.as_ref() == b"name" {
                                    arg_name = attr
                                        .unescape_value()
                                        .map(|v| v.into_owned())
                                        .unwrap_or_default();
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                // Self-closing <argument name="x"/> declares an argument
                // with no description.
                if depth == 3
                    && e.local_name().as_ref() == b"argument"
                    && let Some(pending) = tool.as_mut()
                {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"name" {
                            let name = attr
                                .unescape_value()
                                .map(|v| v.into_owned())
                                .unwrap_or_default();
                            pending.arguments.insert(name, String::new());
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let Ok(unescaped) = t.unescape() {
                    text.push_str(&unescaped);
                }
            }
            Ok(Event::CData(t)) => {
                text.push_str(&String::from_utf8_lossy(&t));
            }
            Ok(Event::End(_)) => {
                match depth {
                    4 => {
                        if let (Some(pending), Some(name)) = (tool.as_mut(), field.take()) {
                            pending.set_field(&name, &arg_name, text.trim());
                        }
                        text.clear();
                    }
                    3 => {
                        if let Some(pending) = tool.take()
                            && pending.enabled
                            && !pending.name.is_empty()
                        {
                            by_type
                                .entry(schema_type.clone())
                                .or_default()
                                .push(pending.into_descriptor(&schema_type));
                        }
                    }
                    _ => {}
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => anyhow::bail!("tools.xml parse error at byte {}: {e}", reader.buffer_position()),
        }
    }

    Ok(by_type)
}

struct PendingTool {
    name: String,
    enabled: bool,
    arguments: BTreeMap<String, String>,
    examples: Vec<String>,
    prompt: String,
    return_structure: Option<Value>,
    handler: Option<String>,
}

impl PendingTool {
    fn set_field(&mut self, field: &str, arg_name: &str, text: &str) {
        match field {
            "argument" => {
                self.arguments
                    .insert(arg_name.to_string(), text.to_string());
            }
            "example" => {
                if !text.is_empty() {
                    self.examples.push(text.to_string());
                }
            }
            "prompt" => self.prompt = text.to_string(),
            "returnStruc" => match serde_json::from_str(text) {
                Ok(value) => self.return_structure = Some(value),
                Err(e) => {
                    warn!(tool = %self.name, error = %e, "invalid returnStruc, ignoring");
                }
            },
            "handler" => self.handler = Some(text.to_string()),
            _ => {}
        }
    }

    fn into_descriptor(self, schema_type: &str) -> ToolDescriptor {
        ToolDescriptor {
            handler: self
                .handler
                .as_deref()
                .map(ToolHandlerKind::parse)
                .unwrap_or(ToolHandlerKind::Search),
            name: self.name,
            schema_type: schema_type.to_string(),
            arguments: self.arguments,
            examples: self.examples,
            prompt: self.prompt,
            return_structure: self
                .return_structure
                .unwrap_or_else(|| serde_json::json!({"score": "integer 0-100"})),
        }
    }
}

impl Default for PendingTool {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            arguments: BTreeMap::new(),
            examples: Vec::new(),
            prompt: String::new(),
            return_structure: None,
            handler: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
<Tools>
  <Thing>
    <Tool name="search">
      <prompt>Score how well plain search fits: {request.query}</prompt>
      <returnStruc>{"score": "integer"}</returnStruc>
      <handler>search</handler>
    </Tool>
    <Tool name="item_details">
      <argument name="item_name">Name of the item</argument>
      <argument name="details_requested">Which details the user wants</argument>
      <example>what is the rating of X</example>
      <prompt>Score item-details fit for: {request.query}</prompt>
      <returnStruc>{"score": "integer", "item_name": "string", "details_requested": "string"}</returnStruc>
      <handler>item_details</handler>
    </Tool>
    <Tool name="legacy" enabled="false">
      <prompt>never loaded</prompt>
    </Tool>
  </Thing>
  <Recipe>
    <Tool name="search">
      <prompt>Score recipe search fit: {request.query}</prompt>
      <returnStruc>{"score": "integer"}</returnStruc>
      <handler>search</handler>
    </Tool>
    <Tool name="ensemble">
      <argument name="queries">Sub-queries, one per course</argument>
      <argument name="ensemble_type">meal_planning, travel_itinerary or outfit</argument>
      <prompt>Score ensemble fit: {request.query}</prompt>
      <returnStruc>{"score": "integer", "queries": "array", "ensemble_type": "string"}</returnStruc>
      <handler>ensemble</handler>
    </Tool>
  </Recipe>
</Tools>
"#;

    #[test]
    fn test_inheritance_merges_thing_tools() {
        let catalogue = ToolCatalogue::from_xml(SAMPLE).unwrap();
        let recipe_tools = catalogue.tools_for_type("Recipe");
        let names: Vec<&str> = recipe_tools.iter().map(|t| t.name.as_str()).collect();
        // Recipe sees its own tools plus inherited item_details.
        assert!(names.contains(&"search"));
        assert!(names.contains(&"ensemble"));
        assert!(names.contains(&"item_details"));
    }

    #[test]
    fn test_specific_tool_overrides_thing_tool() {
        let catalogue = ToolCatalogue::from_xml(SAMPLE).unwrap();
        let search = catalogue
            .tools_for_type("Recipe")
            .into_iter()
            .find(|t| t.name == "search")
            .unwrap();
        assert_eq!(search.schema_type, "Recipe");
        assert!(search.prompt.contains("recipe search"));
    }

    #[test]
    fn test_unknown_type_falls_back_to_thing() {
        let catalogue = ToolCatalogue::from_xml(SAMPLE).unwrap();
        let tools = catalogue.tools_for_type("Movie");
        assert!(tools.iter().any(|t| t.name == "search"));
        assert!(tools.iter().all(|t| t.schema_type == "Thing"));
    }

    #[test]
    fn test_disabled_tools_are_skipped() {
        let catalogue = ToolCatalogue::from_xml(SAMPLE).unwrap();
        let tools = catalogue.tools_for_type("Thing");
        assert!(!tools.iter().any(|t| t.name == "legacy"));
    }

    #[test]
    fn test_arguments_and_handler_parsed() {
        let catalogue = ToolCatalogue::from_xml(SAMPLE).unwrap();
        let details = catalogue
            .tools_for_type("Thing")
            .into_iter()
            .find(|t| t.name == "item_details")
            .unwrap();
        assert_eq!(details.handler, ToolHandlerKind::ItemDetails);
        assert!(details.arguments.contains_key("item_name"));
        assert_eq!(details.examples.len(), 1);
        assert_eq!(details.return_structure["score"], "integer");
    }

    #[test]
    fn test_missing_file_yields_empty_catalogue() {
        let catalogue = ToolCatalogue::load(Path::new("/nonexistent/tools.xml")).unwrap();
        assert!(catalogue.is_empty());
        assert!(catalogue.tools_for_type("Thing").is_empty());
    }
}
