use std::fmt::Write;

use crate::DiffResults;

/// Renders a plain text report over a diff's results: summary, per-step
/// breakdown, per-match rows sorted by similarity, and the unmatched
/// functions of both sides.
pub fn generate_text_report(results: &DiffResults) -> String {
    let mut report = String::new();
    let rule = "=".repeat(60);

    let _ = writeln!(report, "{rule}");
    let _ = writeln!(report, "                 BINARY DIFF REPORT");
    let _ = writeln!(report, "{rule}");
    let _ = writeln!(report);

    let _ = writeln!(report, "SUMMARY:");
    let _ = writeln!(
        report,
        "  Primary:   {} ({})",
        results.primary_executable, results.primary_hash
    );
    let _ = writeln!(
        report,
        "  Secondary: {} ({})",
        results.secondary_executable, results.secondary_hash
    );
    let _ = writeln!(report, "  Similarity: {:.4}", results.similarity);
    let _ = writeln!(report, "  Confidence: {:.4}", results.confidence);
    let _ = writeln!(report, "  Matches: {}", results.matches.len());
    let _ = writeln!(
        report,
        "  Unmatched Functions: {} primary, {} secondary",
        results.unmatched_primary.len(),
        results.unmatched_secondary.len()
    );
    let _ = writeln!(report);

    let _ = writeln!(report, "MATCHES BY STEP:");
    for (step, count) in &results.histogram {
        let _ = writeln!(report, "  {step}: {count}");
    }
    let _ = writeln!(report);

    let _ = writeln!(report, "DETAILED MATCHES:");
    let _ = writeln!(report, "{}", "-".repeat(60));
    let mut sorted = results.matches.clone();
    sorted.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for (i, m) in sorted.iter().enumerate() {
        let _ = writeln!(
            report,
            "{}. {} <-> {}",
            i + 1,
            m.primary_name,
            m.secondary_name
        );
        let _ = writeln!(
            report,
            "   Addresses: {:#x} <-> {:#x}",
            m.primary_address, m.secondary_address
        );
        let _ = writeln!(
            report,
            "   Similarity: {:.4} | Confidence: {:.4} | {}",
            m.similarity, m.confidence, m.change
        );
        let _ = writeln!(
            report,
            "   Step: {} | Blocks: {} | Instructions: {}",
            m.step, m.basic_block_matches, m.instruction_matches
        );
        let _ = writeln!(report);
    }

    if !results.unmatched_primary.is_empty() {
        let _ = writeln!(report, "UNMATCHED FUNCTIONS (PRIMARY):");
        for function in &results.unmatched_primary {
            let _ = writeln!(report, "  {} ({:#x})", function.name, function.address);
        }
        let _ = writeln!(report);
    }
    if !results.unmatched_secondary.is_empty() {
        let _ = writeln!(report, "UNMATCHED FUNCTIONS (SECONDARY):");
        for function in &results.unmatched_secondary {
            let _ = writeln!(report, "  {} ({:#x})", function.name, function.address);
        }
        let _ = writeln!(report);
    }

    report
}
