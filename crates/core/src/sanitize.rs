//! Clean-up applied to every extracted text before quality validation.

use regex::{Regex, RegexBuilder};
use tracing::warn;

const REPLACEMENT: char = '\u{FFFD}';

/// UTF-8 text that was decoded as Windows-1252 somewhere upstream.
const MOJIBAKE: &[(&str, &str)] = &[
    ("Ã§Ã£o", "ção"),
    ("Ã§Ãµes", "ções"),
    ("Ã§Ã£", "çã"),
    ("Ã£o", "ão"),
    ("Ã§", "ç"),
    ("Ã£", "ã"),
    ("Ã¡", "á"),
    ("Ã©", "é"),
    ("Ã­", "í"),
    ("Ã³", "ó"),
    ("Ãº", "ú"),
    ("Ã¢", "â"),
    ("Ãª", "ê"),
    ("Ã´", "ô"),
    ("Ãµ", "õ"),
    ("Ã¼", "ü"),
    ("Ã‰", "É"),
    ("Ãš", "Ú"),
    ("Ã“", "Ó"),
    ("Ã”", "Ô"),
    ("Ã‚", "Â"),
    ("ÃŠ", "Ê"),
    ("Ã‡", "Ç"),
    ("Ãƒ", "Ã"),
    ("Ã•", "Õ"),
    ("Ã€", "À"),
];

/// Word fragments where U+FFFD replaced a lost "fi" ligature. More specific
/// fragments come first.
const LIGATURE_WORDS: &[(&str, &str)] = &[
    ("identi�cad", "identificad"),
    ("identi�", "identifi"),
    ("especí�ca", "específica"),
    ("especi�ca", "especifica"),
    ("con�dencial", "confidencial"),
    ("con�rma", "confirma"),
    ("con�gura", "configura"),
    ("con�", "confi"),
    ("�rmam", "firmam"),
    ("�rma", "firma"),
    ("�nal", "final"),
    ("pro�ssional", "profissional"),
    ("of�cio", "ofício"),
    ("of�cial", "oficial"),
    ("bene�c", "benefíc"),
    ("�sica", "física"),
    ("arti�cial", "artificial"),
    ("dif�cil", "difícil"),
    ("justi�ca", "justifica"),
    ("certi�ca", "certifica"),
    ("rati�ca", "ratifica"),
    ("noti�ca", "notifica"),
    ("modi�ca", "modifica"),
    ("clari�ca", "clarifica"),
    ("signi�ca", "significa"),
    ("�ca", "fica"),
    ("de�n", "defin"),
    ("re�n", "refin"),
    ("in�n", "infin"),
];

#[derive(Debug, Clone)]
pub struct TextSanitizer {
    mojibake: Vec<(&'static str, &'static str)>,
    upper_cao: Regex,
    ligature_words: Vec<(Regex, &'static str)>,
    ligature_inner: Regex,
    ligature_initial: Regex,
    repeated_spaces: Regex,
    blank_lines: Regex,
    space_before_punctuation: Regex,
    glued_punctuation: Regex,
}

impl TextSanitizer {
    pub fn new() -> Result<Self, regex::Error> {
        let mut mojibake = MOJIBAKE.to_vec();
        mojibake.sort_by(|left, right| right.0.chars().count().cmp(&left.0.chars().count()));

        let ligature_words = LIGATURE_WORDS
            .iter()
            .map(|(broken, fixed)| {
                RegexBuilder::new(&regex::escape(broken))
                    .case_insensitive(true)
                    .build()
                    .map(|regex| (regex, *fixed))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            mojibake,
            upper_cao: Regex::new(r"([A-ZÇÃÕ]{2,})ÇÍO")?,
            ligature_words,
            ligature_inner: RegexBuilder::new(r"([a-záéíóúãõâêôàçü])\x{FFFD}([aeiouc])")
                .case_insensitive(true)
                .build()?,
            ligature_initial: RegexBuilder::new(r"(^|[^\p{L}\p{N}])\x{FFFD}([aeiouc])")
                .case_insensitive(true)
                .multi_line(true)
                .build()?,
            repeated_spaces: Regex::new(r" {2,}")?,
            blank_lines: Regex::new(r"\n{3,}")?,
            space_before_punctuation: Regex::new(r" +([.,;:!?)])")?,
            glued_punctuation: Regex::new(r"([.,;:!?])([A-Za-z])")?,
        })
    }

    pub fn sanitize(&self, text: &str) -> String {
        let text = strip_control_chars(text);
        let text = self.fix_encoding(text);
        let text = self.fix_ligatures(text);
        self.normalize_whitespace(&text)
    }

    fn fix_encoding(&self, mut text: String) -> String {
        for (broken, fixed) in &self.mojibake {
            if text.contains(broken) {
                text = text.replace(broken, fixed);
            }
        }
        self.upper_cao.replace_all(&text, "${1}ÇÃO").into_owned()
    }

    fn fix_ligatures(&self, mut text: String) -> String {
        if !text.contains(REPLACEMENT) {
            return text;
        }
        for (broken, fixed) in &self.ligature_words {
            text = broken.replace_all(&text, *fixed).into_owned();
        }
        text = self.ligature_inner.replace_all(&text, "${1}fi${2}").into_owned();
        text = self.ligature_initial.replace_all(&text, "${1}fi${2}").into_owned();

        let remaining = text.chars().filter(|c| *c == REPLACEMENT).count();
        if remaining > 0 {
            warn!(remaining, "text still contains replacement characters after ligature repair");
        }
        text
    }

    fn normalize_whitespace(&self, text: &str) -> String {
        let text = self.repeated_spaces.replace_all(text, " ");
        let text = text.split('\n').map(str::trim).collect::<Vec<_>>().join("\n");
        let text = self.blank_lines.replace_all(&text, "\n\n");
        let text = self.space_before_punctuation.replace_all(&text, "${1}");
        let text = self.glued_punctuation.replace_all(&text, "${1} ${2}");
        text.trim().to_string()
    }
}

fn strip_control_chars(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}
