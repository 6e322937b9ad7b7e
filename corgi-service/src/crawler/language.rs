//! Language detection over post content
//!
//! Deterministic whatlang detection over the text with markup, URLs, and
//! mentions stripped. Empty or too-short text detects as `unknown`.

use whatlang::Lang;

/// Below this many characters of stripped text, detection is unreliable
const MIN_TEXT_LEN: usize = 20;

/// Tag returned when detection cannot run or fails
pub const UNKNOWN: &str = "unknown";

/// Detect the language of one text. Returns an ISO 639-1 tag where one
/// exists (falling back to whatlang's 639-3 code) and the detector's
/// confidence in [0,1].
pub fn detect(text: &str) -> (String, f64) {
    let stripped = strip_markup(text);
    if stripped.len() < MIN_TEXT_LEN {
        return (UNKNOWN.to_string(), 0.0);
    }
    match whatlang::detect(&stripped) {
        Some(info) => (iso639_1(info.lang()).to_string(), info.confidence()),
        None => (UNKNOWN.to_string(), 0.0),
    }
}

/// Batch detection: one `(language, confidence)` tuple per input
pub fn detect_batch<'a, I>(texts: I) -> Vec<(String, f64)>
where
    I: IntoIterator<Item = &'a str>,
{
    texts.into_iter().map(detect).collect()
}

/// Drop HTML tags, URLs, and mention handles so boilerplate does not drown
/// the signal
fn strip_markup(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }

    text.split_whitespace()
        .filter(|word| {
            !word.starts_with("http://")
                && !word.starts_with("https://")
                && !word.starts_with('@')
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn iso639_1(lang: Lang) -> &'static str {
    match lang {
        Lang::Eng => "en",
        Lang::Spa => "es",
        Lang::Por => "pt",
        Lang::Fra => "fr",
        Lang::Deu => "de",
        Lang::Ita => "it",
        Lang::Nld => "nl",
        Lang::Rus => "ru",
        Lang::Ukr => "uk",
        Lang::Pol => "pl",
        Lang::Swe => "sv",
        Lang::Dan => "da",
        Lang::Fin => "fi",
        Lang::Nob => "nb",
        Lang::Jpn => "ja",
        Lang::Kor => "ko",
        Lang::Cmn => "zh",
        Lang::Ara => "ar",
        Lang::Tur => "tr",
        Lang::Ces => "cs",
        Lang::Ell => "el",
        Lang::Heb => "he",
        Lang::Hin => "hi",
        Lang::Ind => "id",
        Lang::Vie => "vi",
        other => other.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_or_empty_text_is_unknown() {
        assert_eq!(detect(""), (UNKNOWN.to_string(), 0.0));
        assert_eq!(detect("hi").0, UNKNOWN);
        assert_eq!(detect("<p>ok</p>").0, UNKNOWN);
    }

    #[test]
    fn detects_english_and_spanish() {
        let (lang, confidence) =
            detect("<p>The quick brown fox jumps over the lazy dog every single morning.</p>");
        assert_eq!(lang, "en");
        assert!(confidence > 0.0);

        let (lang, _) = detect(
            "<p>El rápido zorro marrón salta sobre el perro perezoso todas las mañanas.</p>",
        );
        assert_eq!(lang, "es");
    }

    #[test]
    fn markup_urls_and_mentions_are_stripped() {
        let stripped = strip_markup(
            "<p>Hello <a href=\"https://x.y\">world</a> @friend https://example.com again</p>",
        );
        assert_eq!(stripped, "Hello world again");
    }

    #[test]
    fn batch_returns_one_tuple_per_input() {
        let results = detect_batch([
            "The quick brown fox jumps over the lazy dog every single morning.",
            "",
        ]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "en");
        assert_eq!(results[1].0, UNKNOWN);
    }
}
