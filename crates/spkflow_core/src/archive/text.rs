//! Parsers for the text-mode outputs the procedures read back.
//!
//! Three shapes appear in practice:
//! - `key value` lines (per-utterance scalars such as average log-likelihoods)
//! - `key [ v1 v2 ... ]` lines (text-mode vectors)
//! - `enroll probe score` lines (trial scores)

use super::error::{FormatError, FormatResult};

/// One scored trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialScore {
    pub enroll: String,
    pub probe: String,
    pub score: f64,
}

/// Parse `key value` lines. Blank lines are skipped.
pub fn parse_scalar_lines(text: &str) -> FormatResult<Vec<(String, f64)>> {
    let mut out = Vec::new();
    for (idx, line) in numbered_lines(text) {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(FormatError::bad_text_line(
                idx,
                format!("expected 'key value', got {:?}", line),
            ));
        };
        out.push((key.to_string(), parse_number(idx, value)?));
    }
    Ok(out)
}

/// Parse `key [ v1 v2 ... ]` lines. Blank lines are skipped.
pub fn parse_text_vectors(text: &str) -> FormatResult<Vec<(String, Vec<f64>)>> {
    let mut out = Vec::new();
    for (idx, line) in numbered_lines(text) {
        let mut fields = line.split_whitespace();
        let key = fields
            .next()
            .ok_or_else(|| FormatError::bad_text_line(idx, "missing key"))?;
        if fields.next() != Some("[") {
            return Err(FormatError::bad_text_line(idx, "expected '[' after key"));
        }

        let mut values = Vec::new();
        let mut closed = false;
        for field in fields.by_ref() {
            if field == "]" {
                closed = true;
                break;
            }
            values.push(parse_number(idx, field)?);
        }
        if !closed || fields.next().is_some() {
            return Err(FormatError::bad_text_line(idx, "vector not closed by a final ']'"));
        }
        out.push((key.to_string(), values));
    }
    Ok(out)
}

/// Parse `enroll probe score` lines. Blank lines are skipped.
pub fn parse_trial_scores(text: &str) -> FormatResult<Vec<TrialScore>> {
    let mut out = Vec::new();
    for (idx, line) in numbered_lines(text) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [enroll, probe, score] = fields.as_slice() else {
            return Err(FormatError::bad_text_line(
                idx,
                format!("expected 'enroll probe score', got {:?}", line),
            ));
        };
        out.push(TrialScore {
            enroll: enroll.to_string(),
            probe: probe.to_string(),
            score: parse_number(idx, score)?,
        });
    }
    Ok(out)
}

/// Non-blank lines with 1-based line numbers.
fn numbered_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty())
}

fn parse_number(line: usize, field: &str) -> FormatResult<f64> {
    field
        .parse::<f64>()
        .map_err(|_| FormatError::bad_text_line(line, format!("{:?} is not a number", field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_lines() {
        let parsed = parse_scalar_lines("abc -41.25\n\nxyz 3e-2\n").unwrap();
        assert_eq!(
            parsed,
            vec![("abc".to_string(), -41.25), ("xyz".to_string(), 0.03)]
        );
    }

    #[test]
    fn scalar_line_with_extra_field_fails() {
        let err = parse_scalar_lines("abc 1.0 2.0").unwrap_err();
        assert!(matches!(err, FormatError::BadTextLine { line: 1, .. }));
    }

    #[test]
    fn text_vectors() {
        let parsed = parse_text_vectors("spk0  [ 1 -2.5 3e1 ]\nspk1 [ ]\n").unwrap();
        assert_eq!(parsed[0].0, "spk0");
        assert_eq!(parsed[0].1, vec![1.0, -2.5, 30.0]);
        assert!(parsed[1].1.is_empty());
    }

    #[test]
    fn unclosed_vector_fails() {
        assert!(parse_text_vectors("spk0 [ 1 2").is_err());
        assert!(parse_text_vectors("spk0 1 2 ]").is_err());
    }

    #[test]
    fn trial_scores() {
        let parsed = parse_trial_scores("spk0 spk1 -23.9922\n").unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].enroll, "spk0");
        assert_eq!(parsed[0].probe, "spk1");
        assert!((parsed[0].score + 23.9922).abs() < 1e-12);
    }

    #[test]
    fn non_numeric_score_names_the_line() {
        let err = parse_trial_scores("a b c\nd e nan?\n").unwrap_err();
        assert!(matches!(err, FormatError::BadTextLine { line: 1, .. }));
    }
}
