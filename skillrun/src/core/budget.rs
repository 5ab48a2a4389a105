//! Token budget helpers shared by the prompt builder and disclosure engine.

use crate::core::types::TokenBudget;

/// Deterministic token estimate: one token per four characters, rounded up.
///
/// Every budget in the crate goes through this function so that numbers are
/// comparable across the prompt builder, disclosure caps, and session memory.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Size one turn's prompt.
///
/// Disclosed content never receives more than half of the available budget.
pub fn compute_token_budget(
    max_context_tokens: usize,
    response_headroom_tokens: usize,
    disclosed_text: &str,
) -> TokenBudget {
    let available = max_context_tokens.saturating_sub(response_headroom_tokens);
    let disclosure = estimate_tokens(disclosed_text).min(available / 2);
    TokenBudget {
        max_context_tokens,
        response_headroom_tokens,
        allocated_prompt_tokens: available,
        allocated_disclosure_tokens: disclosure,
    }
}
