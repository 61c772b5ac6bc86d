//! Prompt builders for the LLM steps. Each prompt opens with a stable
//! directive tag; the response contracts live in `synthesis` and
//! `resolution`.

use crate::model::{SourceSummary, Subtopic};

pub const TAG_DECOMPOSITION: &str = "[topic_decomposition]";
pub const TAG_RESEARCH_PLAN: &str = "[research_plan]";
pub const TAG_SUMMARIZE: &str = "[summarize_source]";
pub const TAG_KNOWLEDGE_TREE: &str = "[build_knowledge_tree]";
pub const TAG_INSIGHTS: &str = "[generate_insights]";
pub const TAG_SPIKY_POV: &str = "[spiky_pov]";
pub const TAG_REPORT: &str = "[synthesize_report]";
pub const TAG_ENUMERATION: &str = "[search_space_enumeration]";
pub const TAG_EXTRACTION: &str = "[extract_entities]";

pub fn decomposition(query: &str, max_subtopics: usize) -> String {
    format!(
        "{TAG_DECOMPOSITION} Split the research query into at most {max_subtopics} focused \
         subtopics, each with a short focus_area label.\n\
         Query: {query}\n\
         Respond with JSON: {{\"subtopics\": [{{\"query\": \"...\", \"focus_area\": \"...\"}}]}}"
    )
}

pub fn research_plan(query: &str, subtopics: &[Subtopic]) -> String {
    let subtopic_list = subtopics
        .iter()
        .map(|s| format!("- {} ({})", s.query, s.focus_area))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{TAG_RESEARCH_PLAN} Produce a research plan for the query below.\n\
         Query: {query}\n\
         Subtopics:\n{subtopic_list}\n\
         Respond with JSON: {{\"objectives\": [...], \"deliverables\": [...], \
         \"key_questions\": [...], \"strategies\": [{{\"name\": \"...\", \"methods\": [...], \
         \"sources\": [...], \"keywords\": [...]}}]}}"
    )
}

pub fn summarize(title: &str, url: &str, content: &str, subtopic: &str) -> String {
    format!(
        "{TAG_SUMMARIZE} Summarize this source for the subtopic '{subtopic}'. Extract atomic, \
         source-grounded facts.\n\
         Title: {title}\nURL: {url}\nContent:\n{content}\n\
         Respond with JSON: {{\"summary\": \"...\", \"facts\": [\"...\"]}}"
    )
}

pub fn knowledge_tree(summaries: &[SourceSummary]) -> String {
    let corpus = summaries
        .iter()
        .map(|s| {
            format!(
                "- source_id={} subtopic='{}' summary: {}",
                s.source_id, s.subtopic, s.summary
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{TAG_KNOWLEDGE_TREE} Cluster these source summaries into a knowledge forest. Roots are \
         categories; leaves must cite source_ids from the list.\n\
         Summaries:\n{corpus}\n\
         Respond with JSON: {{\"nodes\": [{{\"ref_id\": \"...\", \"parent_ref\": null, \
         \"category\": \"...\", \"subcategory\": null, \"summary\": \"...\", \
         \"sources\": [{{\"source_id\": \"...\", \"relevance\": 0.9}}]}}]}}"
    )
}

pub fn insights(tree_digest: &str, source_ids: &[String]) -> String {
    format!(
        "{TAG_INSIGHTS} Synthesize DOK-3 insights from this knowledge tree. Every insight must \
         cite at least one source_id from [{}].\n\
         Tree:\n{tree_digest}\n\
         Respond with JSON: {{\"insights\": [{{\"category\": \"...\", \"insight_text\": \"...\", \
         \"confidence\": 0.8, \"source_ids\": [\"...\"]}}]}}",
        source_ids.join(", ")
    )
}

pub fn spiky_povs(insight_digest: &str) -> String {
    format!(
        "{TAG_SPIKY_POV} Produce contrarian points of view over these insights: truths the \
         evidence supports against conventional wisdom, and myths it debunks. Every POV must \
         cite at least one insight id.\n\
         Insights:\n{insight_digest}\n\
         Respond with JSON: {{\"truths\": [{{\"statement\": \"...\", \"reasoning\": \"...\", \
         \"insight_ids\": [\"...\"]}}], \"myths\": [...]}}"
    )
}

pub fn report(query: &str, tree_digest: &str, insight_digest: &str, pov_digest: &str) -> String {
    format!(
        "{TAG_REPORT} Assemble the final analytical report for: {query}\n\
         Knowledge tree:\n{tree_digest}\n\
         Insights:\n{insight_digest}\n\
         Spiky POVs:\n{pov_digest}\n\
         Respond with JSON: {{\"sections\": [{{\"name\": \"key_findings\", \"markdown\": \"...\", \
         \"source_ids\": [...]}}, {{\"name\": \"evidence_analysis\", ...}}, \
         {{\"name\": \"causal_relationships\", ...}}, \
         {{\"name\": \"alternative_interpretations\", ...}}]}}"
    )
}

pub fn enumeration(search_space: &str, entities: &[String]) -> String {
    format!(
        "{TAG_ENUMERATION} Decompose the search space '{search_space}' into subspaces (for \
         example by region or category) for finding: {}.\n\
         Respond with JSON: {{\"subspaces\": [\"...\"]}}",
        entities.join(", ")
    )
}

pub fn extraction(
    entity_type: &str,
    attributes: &[String],
    subspace: &str,
    corpus: &str,
    domain_hint: Option<&str>,
) -> String {
    let hint = domain_hint
        .map(|h| format!("\nDomain hint: {h}"))
        .unwrap_or_default();
    format!(
        "{TAG_EXTRACTION} Extract '{entity_type}' entities found in '{subspace}' with these \
         attributes: {}.{hint}\n\
         Sources:\n{corpus}\n\
         Respond with JSON: {{\"entities\": [{{\"name\": \"...\", \"attributes\": {{...}}, \
         \"unique_identifier\": null, \"confidence\": 0.8, \"source_url\": null}}]}}",
        attributes.join(", ")
    )
}
