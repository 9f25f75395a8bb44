// pulsegate/src/eval/report.rs
//
// ROC area and markdown/JSON report output for the eval harness.

use std::fmt::Write;

use super::EvalResult;

/// Area under the ROC curve over per-session bot scores: the probability that
/// a random bot session outscores a random human one, ties counting half.
/// 0.5 when either class is missing.
pub fn auc_roc(result: &EvalResult) -> f64 {
    let bots:   Vec<u8> = result.outcomes.iter().filter(|(_, b)| *b).map(|(s, _)| *s).collect();
    let humans: Vec<u8> = result.outcomes.iter().filter(|(_, b)| !*b).map(|(s, _)| *s).collect();
    if bots.is_empty() || humans.is_empty() {
        return 0.5;
    }
    let mut wins = 0.0;
    for b in &bots {
        for h in &humans {
            if b > h {
                wins += 1.0;
            } else if b == h {
                wins += 0.5;
            }
        }
    }
    wins / (bots.len() * humans.len()) as f64
}

pub fn to_markdown(result: &EvalResult) -> String {
    let mut out = String::new();
    // writing into a String cannot fail
    let _ = render_markdown(result, &mut out);
    out
}

fn render_markdown(r: &EvalResult, out: &mut String) -> std::fmt::Result {
    writeln!(out, "# Pulsegate Evaluation Report")?;
    writeln!(out)?;
    writeln!(
        out,
        "**Records**: {}  **Sessions**: {}  **Bots**: {}  **Humans**: {}  **Unlabelled**: {}  **Trust threshold**: {}",
        r.n_records, r.n_sessions, r.n_positive, r.n_negative, r.n_unlabelled, r.threshold
    )?;
    writeln!(out)?;
    writeln!(out, "| Metric    | Value  |")?;
    writeln!(out, "|-----------|--------|")?;
    writeln!(out, "| Precision | {:.4} |", r.global.precision())?;
    writeln!(out, "| Recall    | {:.4} |", r.global.recall())?;
    writeln!(out, "| F1        | {:.4} |", r.global.f1())?;
    writeln!(out, "| FPR       | {:.4} |", r.global.fpr())?;
    writeln!(out, "| AUC-ROC   | {:.4} |", auc_roc(r))?;
    writeln!(out)?;

    writeln!(out, "## Per-Channel Performance")?;
    writeln!(out)?;
    writeln!(out, "| Channel   | P     | R     | F1    | FPR    |")?;
    writeln!(out, "|-----------|-------|-------|-------|--------|")?;
    let mut channels: Vec<_> = r.per_channel.iter().collect();
    channels.sort_by(|a, b| b.1.f1().total_cmp(&a.1.f1()).then_with(|| a.0.cmp(b.0)));
    for (channel, m) in channels {
        writeln!(out, "| {:9} | {:.3} | {:.3} | {:.3} | {:.4} |",
            channel, m.precision(), m.recall(), m.f1(), m.fpr())?;
    }
    writeln!(out)?;

    writeln!(out, "## Risk Tiers")?;
    writeln!(out)?;
    for (tier, n) in &r.tier_counts {
        writeln!(out, "- {tier}: {n}")?;
    }
    writeln!(out)?;

    writeln!(out, "## Bot Score Distribution")?;
    writeln!(out)?;
    let total = r.n_scored.max(1) as f64;
    for (lower, count) in &r.score_histogram {
        let bar = "#".repeat((*count as f64 / total * 60.0) as usize);
        writeln!(out, "{:3}–{:3} | {:5} | {}", lower, lower + 4, count, bar)?;
    }
    Ok(())
}

pub fn print_markdown(result: &EvalResult) {
    print!("{}", to_markdown(result));
}

/// Serialize the evaluation result to JSON for downstream consumption.
pub fn to_json(result: &EvalResult) -> String {
    serde_json::json!({
        "n_records":       result.n_records,
        "n_sessions":      result.n_sessions,
        "n_positive":      result.n_positive,
        "n_negative":      result.n_negative,
        "n_unlabelled":    result.n_unlabelled,
        "threshold":       result.threshold,
        "precision":       result.global.precision(),
        "recall":          result.global.recall(),
        "f1":              result.global.f1(),
        "fpr":             result.global.fpr(),
        "auc_roc":         auc_roc(result),
        "confusion":       result.global,
        "per_channel":     result.per_channel,
        "tier_counts":     result.tier_counts,
        "score_histogram": result.score_histogram,
    })
    .to_string()
}
