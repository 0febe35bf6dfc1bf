//! Request construction and local fallback variants.

use std::fmt::Write as _;

use crate::records::{Batch, GeneratedVariant};

/// Characters of each source answer embedded in a prompt.
pub const ANSWER_PREVIEW_CHARS: usize = 400;
const FALLBACK_SHORT_QUESTION: usize = 100;

/// Builds one prompt covering every record of `batch`.
///
/// Records are numbered from 1; the number is the `original_id` the model is
/// asked to echo back.
pub fn build_prompt(batch: &Batch<'_>, variants_per_record: usize) -> String {
    let mut prompt = String::with_capacity(1024 + batch.len() * 600);
    let _ = write!(
        prompt,
        "Sağlık alanında chatbot eğitimi için profesyonel veri çoğaltması yapıyoruz.\n\n\
         GÖREV: Aşağıdaki {count} soru-cevap çiftinin her biri için {variants} farklı varyant oluştur.\n\n\
         KURALLAR:\n\
         - Medikal doğruluğu koru\n\
         - [cite: X] referanslarını aynen koru\n\
         - Türkçe dil bilgisi kurallarına uy\n\
         - Tehlikeli veya kesin tavsiyeler verme\n\
         - Profesyonel ton kullan\n\
         - Yalnızca JSON formatında yanıt ver\n\n",
        count = batch.len(),
        variants = variants_per_record,
    );
    for (i, record) in batch.records.iter().enumerate() {
        let _ = write!(
            prompt,
            "--- {}. ORİJİNAL ---\nSoru: {}\nCevap: {}\n\n",
            i + 1,
            record.question,
            preview(&record.answer)
        );
    }
    prompt.push_str(
        "ÇIKTI FORMATI (ZORUNLU):\n\
         {\"augmented_data\": [{\"original_id\": 1, \"variants\": [\
         {\"soru\": \"...\", \"cevap\": \"... [cite: X]\"}]}]}\n\n\
         Sadece JSON yanıtı ver!",
    );
    prompt
}

fn preview(answer: &str) -> String {
    match answer.char_indices().nth(ANSWER_PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &answer[..idx]),
        None => answer.to_string(),
    }
}

/// Rough token count used by the size guard (four characters per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Synthesizes variants locally when a response cannot be parsed.
///
/// Each record yields a "Doktor, ..." rephrasing (unless the question already
/// addresses a doctor) and, for short questions, a "... hakkında bilgi verir
/// misiniz?" rephrasing. Answers are kept verbatim.
pub fn fallback_variants(batch: &Batch<'_>, batch_index: usize) -> Vec<GeneratedVariant> {
    let mut variants = Vec::new();
    for (i, record) in batch.records.iter().enumerate() {
        let question = record.question.trim();
        if question.is_empty() {
            continue;
        }
        let source_id = batch.offset + i;
        let make = |text: String| GeneratedVariant {
            question: text,
            answer: record.answer.clone(),
            source_id,
            batch: batch_index,
            fallback: true,
        };
        if !question.starts_with("Doktor") && !question.starts_with("Dr") {
            variants.push(make(format!("Doktor, {}", question.to_lowercase())));
        }
        if question.chars().count() < FALLBACK_SHORT_QUESTION {
            let base = question.trim_end_matches('?').trim_end_matches('.');
            variants.push(make(format!("{base} hakkında bilgi verir misiniz?")));
        }
    }
    variants
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{partition, SourceRecord};
    use pretty_assertions::assert_eq;

    #[test]
    fn prompt_numbers_records_and_truncates_answers() {
        let long = "x".repeat(450);
        let input = vec![
            SourceRecord::new("Ateş nedir?", "Vücut ısısının yükselmesi [cite: 1]"),
            SourceRecord::new("Uzun?", long.clone()),
        ];
        let batch = partition(&input, 2)[0];
        let prompt = build_prompt(&batch, 2);
        assert!(prompt.contains("1. ORİJİNAL"));
        assert!(prompt.contains("2. ORİJİNAL"));
        assert!(prompt.contains("2 farklı varyant"));
        assert!(prompt.contains(&format!("{}...", "x".repeat(400))));
        assert!(!prompt.contains(&long));
        assert!(prompt.contains("\"augmented_data\""));
    }

    #[test]
    fn token_estimate_is_quarter_of_chars() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("çççç"), 1);
    }

    #[test]
    fn fallback_rephrases_each_record() {
        let input = vec![
            SourceRecord::new("Baş Ağrısı neden olur?", "Stres [cite: 2]"),
            SourceRecord::new("Doktor, ilaç ne zaman alınır?", "Yemekten sonra."),
        ];
        let batch = partition(&input, 2)[0];
        let variants = fallback_variants(&batch, 7);
        let questions: Vec<&str> = variants.iter().map(|v| v.question.as_str()).collect();
        assert_eq!(
            questions,
            vec![
                "Doktor, baş ağrısı neden olur?",
                "Baş Ağrısı neden olur hakkında bilgi verir misiniz?",
                "Doktor, ilaç ne zaman alınır hakkında bilgi verir misiniz?",
            ]
        );
        assert!(variants.iter().all(|v| v.fallback && v.batch == 7));
        assert_eq!(variants[2].source_id, 1);
        assert_eq!(variants[0].answer, "Stres [cite: 2]");
    }

    #[test]
    fn fallback_skips_long_question_suffix() {
        let question = format!("{}?", "a".repeat(120));
        let input = vec![SourceRecord::new(question, "cevap metni burada")];
        let variants = fallback_variants(&partition(&input, 1)[0], 0);
        assert_eq!(variants.len(), 1);
        assert!(variants[0].question.starts_with("Doktor, "));
    }

    #[test]
    fn fallback_strips_question_marks_before_periods() {
        let input = vec![
            SourceRecord::new("Dr önerisi nedir.?", "cevap"),
            SourceRecord::new("Dr ne der?.?", "cevap"),
        ];
        let variants = fallback_variants(&partition(&input, 2)[0], 0);
        let questions: Vec<_> = variants.iter().map(|v| v.question.as_str()).collect();
        assert_eq!(
            questions,
            vec![
                "Dr önerisi nedir hakkında bilgi verir misiniz?",
                "Dr ne der? hakkında bilgi verir misiniz?",
            ]
        );
    }
}
