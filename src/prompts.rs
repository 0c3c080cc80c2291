//! Prompt templates and the placeholder-fill machinery shared by the
//! pre-checks, the ranking engine, the tool router, and the tool
//! handlers. Templates use `{dotted.name}` placeholders; catalogue
//! scoring prompts from `tools.xml` go through the same fill.

use serde_json::{Value, json};

/// Replace `{name}` placeholders with the given values. Unknown
/// placeholders are left in place so prompt bugs are visible in logs.
pub fn fill(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

pub const DECONTEXTUALIZE_PREV_QUERIES: &str = "\
The user is querying the site {site.name} looking for items of type {site.itemType}. \
Earlier queries in this conversation were: {request.prev_queries}. \
The latest query is: {request.query}. \
Rewrite the latest query so that it is fully self-contained, resolving \
pronouns and implicit references using the earlier queries. If the query \
is already self-contained, return it unchanged.";

pub const DECONTEXTUALIZE_CONTEXT_URL: &str = "\
The user is querying the site {site.name} looking for items of type {site.itemType}. \
The query was issued from a page with this summary: {context.description}. \
The query is: {request.query}. \
Rewrite the query so that it is fully self-contained, resolving implicit \
references to the page. If the query is already self-contained, return it \
unchanged.";

pub const DECONTEXTUALIZE_FULL: &str = "\
The user is querying the site {site.name} looking for items of type {site.itemType}. \
Earlier queries were: {request.prev_queries}. The query was issued from a \
page with this summary: {context.description}. The latest query is: \
{request.query}. Rewrite the latest query so that it is fully \
self-contained, using both the earlier queries and the page context.";

pub fn decontextualize_struc() -> Value {
    json!({
        "requires_decontextualization": "true or false",
        "decontextualized_query": "the rewritten, self-contained query",
    })
}

pub const RELEVANCE_DETECTION: &str = "\
The site {site.name} hosts items of type {site.itemType}. \
Decide whether the query could plausibly be answered by items on this \
site. A query is irrelevant only when it has nothing to do with the \
site's content, e.g. 'how many angels can dance on a pinhead' asked of a \
recipe site. Query: {request.query}";

pub fn relevance_struc() -> Value {
    json!({
        "site_is_irrelevant_to_query": "true or false",
        "explanation_for_irrelevance": "one sentence, empty when relevant",
    })
}

pub const MEMORY: &str = "\
Analyze the query for statements the user wants remembered across \
conversations, such as dietary restrictions, allergies, or standing \
preferences ('I am vegetarian', 'no cilantro ever'). Query: {request.query}";

pub fn memory_struc() -> Value {
    json!({
        "is_memory_request": "true or false",
        "memory_request": "the statement to remember, empty if none",
    })
}

pub const REQUIRED_INFO: &str = "\
The site {site.name} answers queries about items of type {site.itemType}. \
Check whether the query, together with any earlier queries, carries the \
information needed to produce a useful answer. If something essential is \
missing, phrase one short question to ask the user. \
Query: {request.query}. Earlier queries: {request.prev_queries}";

pub fn required_info_struc() -> Value {
    json!({
        "required_info_found": "true or false",
        "user_question": "question to ask the user, empty if nothing is missing",
    })
}

pub const DETECT_ITEM_TYPE: &str = "\
What schema.org item type best describes what the user is asking for? \
Answer with a single type name such as Recipe, Movie, Product, \
Restaurant, Book or Thing. Query: {request.query}";

pub fn detect_item_type_struc() -> Value {
    json!({"item_type": "schema.org type name"})
}

pub const DETECT_MULTI_ITEM_TYPE: &str = "\
Does the query ask for several different types of items at once (e.g. a \
hotel and a restaurant, an appetiser and a dessert)? \
Query: {request.query}";

pub fn detect_multi_item_type_struc() -> Value {
    json!({
        "is_multi_item_type_query": "true or false",
        "item_types": "array of schema.org type names involved",
    })
}

pub const DETECT_QUERY_TYPE: &str = "\
Classify the query as one of: search (find matching items), details \
(asking about a specific known item), comparison (two named items), \
aggregation (a composed set of items), statistics (numeric facts about \
places or populations). Query: {request.query}";

pub fn detect_query_type_struc() -> Value {
    json!({"query_type": "search | details | comparison | aggregation | statistics"})
}

pub const RANKING: &str = "\
Assign a score from 0 to 100 for how well this item answers the user's \
query. A score above 75 means the item is a very good answer, 50-75 a \
plausible answer, below 50 a poor answer. Also write one short sentence \
describing why the item fits (or does not). \
User query: {request.query}. \
Earlier queries in this conversation, for context: {request.prev_queries}. \
Item: {item.description}";

pub fn ranking_struc() -> Value {
    json!({
        "score": "integer 0-100",
        "description": "one-sentence justification",
    })
}

pub const ITEM_MATCHING: &str = "\
The user is asking about an item called '{item.name}' and wants: \
{request.details_requested}. Score from 0 to 100 how confident you are \
that the item below is the one the user means. If the score is above 75, \
also extract the requested details from the item. \
Item: {item.description}";

pub fn item_matching_struc() -> Value {
    json!({
        "score": "integer 0-100",
        "explanation": "one sentence",
        "item_details": "the requested details, extracted from the item",
    })
}

pub const FIND_ITEM: &str = "\
Score from 0 to 100 how confident you are that the item below is the one \
called '{item.name}'. Item: {item.description}";

pub fn find_item_struc() -> Value {
    json!({"score": "integer 0-100", "explanation": "one sentence"})
}

pub const COMPARE_ITEMS: &str = "\
Compare these two items for the user. Highlight the most meaningful \
differences and say which one is preferable for which purpose. \
Item 1: {request.item1_description}. \
Item 2: {request.item2_description}.";

pub const COMPARE_ITEM_DETAILS: &str = "\
Compare these two items with respect to: {request.details_requested}. \
Item 1: {request.item1_description}. \
Item 2: {request.item2_description}.";

pub fn compare_items_struc() -> Value {
    json!({
        "comparison": {
            "summary": "2-3 sentence overall comparison",
            "item1_strengths": "array of strings",
            "item2_strengths": "array of strings",
        }
    })
}

pub const ENSEMBLE_ITEM_RANKING: &str = "\
The user's overall request is: {request.query}. One aspect of it is: \
{ensemble.sub_query}. Score from 0 to 100 how well this item serves that \
aspect. Item: {item.description}";

pub const ENSEMBLE_SYNTHESIS: &str = "\
The user asked: {request.query}. Build a cohesive {ensemble.type} \
recommendation from the candidate items below, choosing items that work \
well together. Use only items from the list; reference each by its exact \
name and url. Candidates: {ensemble.candidates}";

pub fn ensemble_synthesis_struc() -> Value {
    json!({
        "theme": "one sentence describing the overall recommendation",
        "items": [{
            "category": "role of the item in the ensemble, e.g. appetiser",
            "name": "exact item name from the candidates",
            "url": "exact item url from the candidates",
            "description": "one sentence about the item",
            "why_recommended": "why it fits the request and the other picks",
        }],
    })
}

pub const SYNTHESIZE_ANSWER: &str = "\
Answer the user's question from the items below. Cite only items that \
support the answer, listing their urls. Question: {request.query}. \
Items: {items.descriptions}";

pub fn synthesize_struc() -> Value {
    json!({
        "answer": "a few sentences answering the question",
        "urls": "array of urls of the items the answer draws on",
    })
}

pub const ITEM_DESCRIPTION: &str = "\
In one or two sentences, describe how this item bears on the question \
'{request.query}' and the answer '{answer.text}'. \
Item: {item.description}";

pub fn item_description_struc() -> Value {
    json!({"description": "one or two sentences"})
}

pub const SUMMARIZE_RESULTS: &str = "\
Summarise, in a short paragraph addressed to the user, how the items \
below answer the query '{request.query}'. \
Items: {items.descriptions}";

pub fn summarize_struc() -> Value {
    json!({"message": "short paragraph"})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_replaces_known_placeholders() {
        let out = fill(
            "query: {request.query} on {site.name}",
            &[
                ("request.query", "pasta".to_string()),
                ("site.name", "seriouseats".to_string()),
            ],
        );
        assert_eq!(out, "query: pasta on seriouseats");
    }

    #[test]
    fn test_fill_leaves_unknown_placeholders_visible() {
        let out = fill("a {known} b {unknown}", &[("known", "x".to_string())]);
        assert_eq!(out, "a x b {unknown}");
    }
}
