//! Statistics queries ("median income in King County vs Pierce County")
//! are matched against a catalogue of parameterised templates, their
//! slots mapped to Data-Commons-style DCIDs, and answered with an
//! embeddable chart component.

use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::llm::{Tier, extract_score};
use crate::messages::Message;
use crate::prompts;
use crate::state::QueryContext;

/// Template matches below this score are discarded.
const TEMPLATE_THRESHOLD: u32 = 70;

/// One parameterised statistical-query template.
#[derive(Debug, Clone)]
pub struct StatTemplate {
    pub id: String,
    pub pattern: String,
    /// Return schema for slot extraction; always includes `score`.
    pub variables: Value,
}

/// Parse the template file: numbered lines of the form
/// `N. pattern text {"slot": "description", ...}`.
pub fn parse_templates(contents: &str) -> Vec<StatTemplate> {
    let mut templates = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((id, rest)) = line.split_once('.') else {
            continue;
        };
        let rest = rest.trim();
        let (pattern, mut variables) = match rest.find('{') {
            Some(brace) => {
                let vars: Value = serde_json::from_str(rest[brace..].trim()).unwrap_or_else(|e| {
                    warn!(template = %id.trim(), error = %e, "bad template variables, using empty set");
                    json!({})
                });
                (rest[..brace].trim().to_string(), vars)
            }
            None => (rest.to_string(), json!({})),
        };
        if let Some(map) = variables.as_object_mut() {
            map.insert("score".into(), json!("integer 0-100"));
        }
        templates.push(StatTemplate {
            id: id.trim().to_string(),
            pattern,
            variables,
        });
    }
    templates
}

fn load_templates(path: &Path) -> Vec<StatTemplate> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_templates(&contents),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "statistics templates unavailable");
            Vec::new()
        }
    }
}

fn load_dcid_mappings(path: &Path) -> Value {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_else(|| json!({"variables": {}, "places": {}}))
}

pub async fn run(_args: &Value, ctx: &Arc<QueryContext>) -> Result<(), GatewayError> {
    let query = ctx.decontextualized_query().await;
    let templates = load_templates(&ctx.config.statistics_templates_path());
    if templates.is_empty() {
        ctx.send(Message::IntermediateMessage {
            message: "Statistics lookups are not configured on this deployment.".into(),
        })
        .await?;
        ctx.mark_query_done().await;
        return Ok(());
    }
    let mappings = load_dcid_mappings(&ctx.config.dcid_mappings_path());
    info!(templates = templates.len(), "matching statistics templates");

    // Score every template in parallel; slots are extracted in the same
    // call once a template looks like a match.
    let mut join_set = JoinSet::new();
    for template in templates {
        let ctx = Arc::clone(ctx);
        let query = query.clone();
        join_set.spawn(async move {
            let prompt = format!(
                "User query: \"{query}\"\n\
                 Template pattern: \"{}\"\n\
                 Rate from 0 to 100 how well this template pattern matches the \
                 user's query, considering semantic similarity and whether the \
                 template could answer it. If the score is 70 or higher, also \
                 extract the specific values from the query that fill the \
                 template's variables.",
                template.pattern
            );
            match ctx.llm.ask(&prompt, &template.variables, Tier::Low).await {
                Ok(reply) => Some((template, extract_score(&reply), reply)),
                Err(e) => {
                    debug!(template = %template.id, error = %e, "template scoring failed");
                    None
                }
            }
        });
    }

    let mut matched: Vec<(StatTemplate, u32, Value)> = Vec::new();
    while let Some(result) = join_set.join_next().await {
        if let Ok(Some((template, score, reply))) = result
            && score >= TEMPLATE_THRESHOLD
        {
            matched.push((template, score, reply));
        }
    }
    matched.sort_by(|a, b| b.1.cmp(&a.1));

    let summaries: Vec<Value> = matched
        .iter()
        .map(|(template, score, reply)| {
            json!({
                "template_id": template.id,
                "pattern": template.pattern,
                "score": score,
                "extracted_values": reply,
            })
        })
        .collect();
    ctx.send(Message::StatisticsResult {
        templates: summaries,
    })
    .await?;

    if let Some((template, _, extracted)) = matched.first() {
        match build_chart(ctx, template, extracted, &mappings).await {
            Ok(html) => ctx.send(Message::ChartResult { html }).await?,
            Err(e) => warn!(error = %e, "chart construction failed"),
        }
    } else {
        info!("no statistics template matched");
    }
    ctx.mark_query_done().await;
    Ok(())
}

/// Map the extracted slots to DCIDs and render the web-component markup.
async fn build_chart(
    ctx: &Arc<QueryContext>,
    template: &StatTemplate,
    extracted: &Value,
    mappings: &Value,
) -> Result<String, GatewayError> {
    let variables = string_list(extracted, &["variable", "variables"]);
    let places = string_list(extracted, &["place", "places"]);

    let variable_dcids = map_names(ctx, &variables, &mappings["variables"], false).await;
    let place_dcids = map_names(ctx, &places, &mappings["places"], true).await;

    let component = choose_component(ctx, template, variable_dcids.len(), place_dcids.len()).await;
    let header = template.pattern.replace('"', "");
    Ok(format!(
        "<{component} variables=\"{}\" places=\"{}\" header=\"{header}\"></{component}>",
        variable_dcids.join(" "),
        place_dcids.join(" "),
    ))
}

fn string_list(value: &Value, keys: &[&str]) -> Vec<String> {
    for key in keys {
        match &value[*key] {
            Value::String(s) if !s.is_empty() => return vec![s.clone()],
            Value::Array(list) => {
                return list
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect();
            }
            _ => {}
        }
    }
    Vec::new()
}

/// Resolve names to DCIDs: exact hits in the static mapping first, the
/// LLM as fallback, with a couple of hard-coded place aliases.
async fn map_names(
    ctx: &Arc<QueryContext>,
    names: &[String],
    mapping: &Value,
    is_place: bool,
) -> Vec<String> {
    let mut join_set = JoinSet::new();
    for (idx, name) in names.iter().enumerate() {
        let lower = name.to_lowercase();

        if is_place && matches!(lower.as_str(), "us" | "usa" | "united states" | "america") {
            join_set.spawn(async move { (idx, Some("country/USA".to_string())) });
            continue;
        }
        if let Some(dcid) = mapping[lower.as_str()].as_str() {
            let dcid = dcid.to_string();
            join_set.spawn(async move { (idx, Some(dcid)) });
            continue;
        }

        let ctx = Arc::clone(ctx);
        let name = name.clone();
        let known = mapping.clone();
        join_set.spawn(async move {
            let prompt = if is_place {
                format!(
                    "Place name: \"{name}\". Convert this place name to a Data \
                     Commons place DCID (e.g. geoId/06 for California, \
                     country/USA for the United States). Return just the DCID."
                )
            } else {
                format!(
                    "Variable: \"{name}\". Available DCIDs: {known}. Find the \
                     best matching DCID for this variable; return UNKNOWN if \
                     nothing fits."
                )
            };
            let reply = ctx
                .llm
                .ask(&prompt, &json!({"dcid": "string"}), Tier::Low)
                .await
                .ok();
            let dcid = reply
                .and_then(|r| r["dcid"].as_str().map(str::to_string))
                .filter(|d| !d.is_empty() && d != "UNKNOWN");
            (idx, dcid)
        });
    }

    let mut resolved: Vec<Option<String>> = vec![None; names.len()];
    while let Some(result) = join_set.join_next().await {
        if let Ok((idx, dcid)) = result {
            resolved[idx] = dcid;
        }
    }
    resolved.into_iter().flatten().collect()
}

/// Pick the visualisation component from the query shape.
async fn choose_component(
    ctx: &Arc<QueryContext>,
    template: &StatTemplate,
    num_variables: usize,
    num_places: usize,
) -> String {
    const COMPONENTS: &[&str] = &[
        "datacommons-bar",
        "datacommons-line",
        "datacommons-map",
        "datacommons-scatter",
        "datacommons-ranking",
        "datacommons-highlight",
    ];
    let prompt = format!(
        "Query template: \"{}\" with {num_variables} variable(s) and \
         {num_places} place(s).\n\
         Choose the visualisation component:\n\
         - datacommons-bar: comparing values across places or variables\n\
         - datacommons-line: trends over time\n\
         - datacommons-map: geographic distribution\n\
         - datacommons-scatter: correlation of two variables\n\
         - datacommons-ranking: top/bottom lists\n\
         - datacommons-highlight: a single value\n\
         Return only the component name.",
        template.pattern
    );
    let reply = ctx
        .llm
        .ask(&prompt, &json!({"component_type": "string"}), Tier::Low)
        .await
        .ok();
    reply
        .and_then(|r| r["component_type"].as_str().map(str::to_string))
        .filter(|c| COMPONENTS.contains(&c.as_str()))
        .unwrap_or_else(|| "datacommons-highlight".to_string())
}
