const TEMPLATE_HEAD: &str = r#"You convert free-form prompt text into POML (Prompt Orchestration Markup Language).
Produce one well-formed POML document using this structure:
<prompt>
  <role>The persona the AI should adopt.</role>
  <task>The concrete, actionable task to perform.</task>
  <context>Optional background or constraints.</context>
  <input>The specific input supplied by the user.</input>
  <output>Optional description of the expected output format.</output>
  <examples>Optional input/output pairs that guide the AI.</examples>
</prompt>

Text to convert:
---
"#;

const TEMPLATE_TAIL: &str = r#"
---
Reply with the POML document only."#;

/// Embed user text in the conversion instructions.
pub fn build_prompt(text: &str) -> String {
    let mut prompt = String::with_capacity(TEMPLATE_HEAD.len() + text.len() + TEMPLATE_TAIL.len());
    prompt.push_str(TEMPLATE_HEAD);
    prompt.push_str(text);
    prompt.push_str(TEMPLATE_TAIL);
    prompt
}
