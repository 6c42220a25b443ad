use tracing::info;

pub const SYSTEM_PROMPT: &str = "You are an expert threat intelligence analyst. Analyze the cybersecurity article and create a structured threat intelligence report.

Your analysis must be thorough, technically accurate, and focus on extracting actionable threat intelligence.

Ensure you provide detailed assessment of:
1. Source reliability and credibility
2. Threat actors with proper attribution confidence
3. MITRE ATT&CK techniques with proper IDs and descriptions
4. Critical infrastructure sector impact scoring";

pub const CRITICAL_SECTORS: [&str; 17] = [
    "National Security",
    "Chemical Sector",
    "Commercial Facilities Sector",
    "Communications Sector",
    "Critical Manufacturing Sector",
    "Dams Sector",
    "Defense Industrial Base Sector",
    "Emergency Services Sector",
    "Energy Sector",
    "Financial Services Sector",
    "Food & Agriculture Sector",
    "Government Services & Facilities Sector",
    "Healthcare & Public Health Sector",
    "Information Technology Sector",
    "Nuclear Reactors, Materials, and Waste Sector",
    "Transportation Systems Sector",
    "Water & Wastewater Systems Sector",
];

/// Headroom left for message framing on top of the estimated prompt size.
const TOKEN_BUFFER: f64 = 100.0;
const MIN_KEEP_RATIO: f64 = 0.75;

pub fn sectors_instruction() -> String {
    let mut out = String::from(
        "Only include sectors that are relevant with a score of 2 or higher. Rate each sector's relevance on a scale of 1-5, where:
1: Minimal/No Relevance
2: Low Relevance
3: Moderate Relevance
4: High Relevance
5: Critical Relevance

The sectors to consider are:
",
    );
    for sector in CRITICAL_SECTORS {
        out.push_str("- ");
        out.push_str(sector);
        out.push('\n');
    }
    out.push_str("\nBe specific and factual in your analysis, focusing on evidence from the text.\n");
    out
}

pub fn user_content(url: &str, title: Option<&str>, content: &str) -> String {
    let title = match title.map(str::trim).filter(|t| !t.is_empty()) {
        Some(title) => format!("Title: {}\n", title),
        None => String::new(),
    };
    format!(
        "Article URL: {}\n{}\nContent:\n{}\n\n{}",
        url,
        title,
        content,
        sectors_instruction()
    )
}

/// Rough token count: 1.3 tokens per whitespace-separated word.
pub fn estimate_tokens(text: &str) -> f64 {
    text.split_whitespace().count() as f64 * 1.3
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedContent {
    pub text: String,
    pub truncated: bool,
    pub original_words: usize,
    pub kept_words: usize,
}

/// Shortens `content` to fit the input budget left after the system prompt.
/// The beginning of the article is always kept, never less than 75% of it.
pub fn fit_to_budget(content: &str, max_input_tokens: u32) -> PreparedContent {
    let words: Vec<&str> = content.split_whitespace().collect();
    let available = (max_input_tokens as f64 - estimate_tokens(SYSTEM_PROMPT) - TOKEN_BUFFER).max(0.0);
    let estimate = words.len() as f64 * 1.3;

    if estimate <= available {
        return PreparedContent {
            text: content.to_string(),
            truncated: false,
            original_words: words.len(),
            kept_words: words.len(),
        };
    }

    let ratio = available / estimate;
    let keep = ((words.len() as f64 * ratio) as usize)
        .max((words.len() as f64 * MIN_KEEP_RATIO) as usize)
        .max(1);
    let mut text = words[..keep].join(" ");
    text.push_str(&format!(
        "\n\n[Note: This article was truncated from {} words to {} words due to token limits. The content above represents approximately {}% of the original article.]",
        words.len(),
        keep,
        keep * 100 / words.len()
    ));

    info!(
        "Content truncated from {} to {} words ({} estimated tokens > {} available)",
        words.len(),
        keep,
        estimate as u64,
        available as u64
    );

    PreparedContent {
        text,
        truncated: true,
        original_words: words.len(),
        kept_words: keep,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_content_lists_every_sector() {
        let content = user_content("https://example.com/a", None, "Body text");
        assert!(content.starts_with("Article URL: https://example.com/a\n\nContent:\nBody text"));
        let titled = user_content("https://example.com/a", Some("Loader returns"), "Body text");
        assert!(titled.starts_with("Article URL: https://example.com/a\nTitle: Loader returns\n\nContent:"));
        for sector in CRITICAL_SECTORS {
            assert!(content.contains(&format!("- {}\n", sector)));
        }
    }

    #[test]
    fn test_short_content_is_untouched() {
        let prepared = fit_to_budget("a short article body", 100_000);
        assert!(!prepared.truncated);
        assert_eq!(prepared.text, "a short article body");
        assert_eq!(prepared.kept_words, 4);
    }

    #[test]
    fn test_long_content_keeps_at_least_three_quarters() {
        let content = vec!["word"; 2000].join(" ");
        // Budget far below the content: the 75% floor applies.
        let prepared = fit_to_budget(&content, 200);
        assert!(prepared.truncated);
        assert_eq!(prepared.original_words, 2000);
        assert_eq!(prepared.kept_words, 1500);
        assert!(prepared.text.contains("truncated from 2000 words to 1500 words"));
    }

    #[test]
    fn test_budget_share_wins_over_floor() {
        let content = vec!["token"; 1000].join(" ");
        let budget = (estimate_tokens(SYSTEM_PROMPT) + TOKEN_BUFFER + 1.3 * 900.0).ceil() as u32;
        let prepared = fit_to_budget(&content, budget);
        assert!(prepared.truncated);
        assert!(prepared.kept_words >= 899 && prepared.kept_words <= 900, "{}", prepared.kept_words);
    }

    #[test]
    fn test_tiny_budget_still_sends_a_word() {
        let prepared = fit_to_budget("ransomware", 1);
        assert!(prepared.truncated);
        assert_eq!(prepared.kept_words, 1);
        assert!(prepared.text.starts_with("ransomware\n\n[Note:"));
    }
}
