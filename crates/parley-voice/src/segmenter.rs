//! Sentence segmentation of generated replies into speakable units.
//!
//! Punctuation rule:
//! - `.`, `!`, `?`, `…` and their CJK forms end a sentence when the run of terminators
//!   (plus any closing quotes or brackets) is followed by whitespace or end of text.
//!   `3.14` or `example.com` therefore stay intact. Full-width terminators (`。！？`)
//!   always end a sentence since CJK text has no spaces between sentences.
//! - Full stops and ellipses are dropped from the spoken unit; `!` and `?` are kept
//!   because they change prosody.
//! - Units are trimmed; empty units and units made only of punctuation are skipped.
//!
//! Text without any terminator yields a single unit equal to the trimmed input.

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…' | '。' | '！' | '？')
}

fn is_expressive(c: char) -> bool {
    matches!(c, '!' | '?' | '！' | '？')
}

fn is_full_width(c: char) -> bool {
    matches!(c, '。' | '！' | '？')
}

fn is_closer(c: char) -> bool {
    matches!(c, '"' | '\'' | '”' | '’' | ')' | ']' | '»')
}

/// Split `text` into ordered, non-empty sentences. Total and deterministic.
pub fn segment(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if !is_terminator(c) {
            current.push(c);
            continue;
        }

        let mut run = String::from(c);
        while let Some(&next) = chars.peek() {
            if is_terminator(next) || is_closer(next) {
                run.push(next);
                chars.next();
            } else {
                break;
            }
        }

        let at_boundary =
            run.chars().any(is_full_width) || chars.peek().map_or(true, |n| n.is_whitespace());
        if !at_boundary {
            current.push_str(&run);
            continue;
        }

        let keep_expressive = run.chars().any(is_expressive);
        for r in run.chars() {
            if is_closer(r) || (keep_expressive && is_expressive(r)) {
                current.push(r);
            }
        }
        push_sentence(&mut sentences, &current);
        current.clear();
    }
    push_sentence(&mut sentences, &current);

    sentences
}

fn push_sentence(sentences: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| is_terminator(c) || is_closer(c)) {
        return;
    }
    sentences.push(trimmed.to_string());
}
