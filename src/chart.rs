// Breakdown chart data, shared by the web card and the terminal output.

use serde::Serialize;

use crate::footprint::FootprintResult;

pub const SLICE_COLORS: [&str; 4] = ["#0088FE", "#00C49F", "#FFBB28", "#FF8042"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSlice {
    pub stage: String,
    pub liters: f64,
    /// Share of the breakdown total, 0..=100.
    pub percent: f64,
    pub color: &'static str,
}

/// One slice per breakdown stage, in order. Shares are relative to the sum of
/// the stages, which need not equal the reported total.
pub fn breakdown_slices(result: &FootprintResult) -> Vec<ChartSlice> {
    let total: f64 = result.breakdown.iter().map(|stage| stage.liters.max(0.0)).sum();
    result
        .breakdown
        .iter()
        .enumerate()
        .map(|(index, stage)| ChartSlice {
            stage: stage.stage.clone(),
            liters: stage.liters,
            percent: if total > 0.0 {
                stage.liters.max(0.0) / total * 100.0
            } else {
                0.0
            },
            color: SLICE_COLORS[index % SLICE_COLORS.len()],
        })
        .collect()
}

/// Formats liters with thousands separators, dropping a zero fraction.
pub fn format_liters(liters: f64) -> String {
    let rounded = (liters * 10.0).round() / 10.0;
    let whole = rounded.trunc().abs() as u64;
    let digits = whole.to_string();

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if rounded < 0.0 { "-" } else { "" };
    let tenths = ((rounded.abs() - whole as f64) * 10.0).round() as u64;
    if tenths == 0 {
        format!("{sign}{grouped}")
    } else {
        format!("{sign}{grouped}.{tenths}")
    }
}

/// Plain-text rendering of a result card with a bar per stage.
pub fn render_card(result: &FootprintResult, bar_width: usize) -> String {
    let slices = breakdown_slices(result);
    let label_width = slices
        .iter()
        .map(|slice| slice.stage.chars().count())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    out.push_str(&format!("{}\n", result.item_name));
    out.push_str(&format!(
        "{} liters of water\n",
        format_liters(result.water_footprint_liters)
    ));
    out.push_str(&format!(
        "That's roughly equivalent to {}.\n\n",
        result.comparison
    ));
    out.push_str("Water Usage Breakdown\n");
    for slice in &slices {
        let filled = ((slice.percent / 100.0) * bar_width as f64).round() as usize;
        out.push_str(&format!(
            "  {:<label_width$}  {:<bar_width$}  {:>3.0}%  ({} L)\n",
            slice.stage,
            "█".repeat(filled.min(bar_width)),
            slice.percent,
            format_liters(slice.liters),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::footprint::BreakdownStage;

    fn coffee() -> FootprintResult {
        FootprintResult {
            item_name: "Coffee (1 cup)".to_string(),
            water_footprint_liters: 140.0,
            comparison: "about one minute of a running shower".to_string(),
            breakdown: vec![
                BreakdownStage {
                    stage: "Growing".to_string(),
                    liters: 130.0,
                },
                BreakdownStage {
                    stage: "Processing".to_string(),
                    liters: 10.0,
                },
            ],
        }
    }

    #[test]
    fn test_two_stage_breakdown_gives_two_slices() {
        let slices = breakdown_slices(&coffee());
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].stage, "Growing");
        assert_eq!(slices[0].color, "#0088FE");
        assert_eq!(slices[1].color, "#00C49F");
        assert!((slices[0].percent - 92.857).abs() < 0.01);
        assert!((slices[0].percent + slices[1].percent - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_colors_cycle_after_four_stages() {
        let mut result = coffee();
        result.breakdown = (0..5)
            .map(|i| BreakdownStage {
                stage: format!("Stage {i}"),
                liters: 1.0,
            })
            .collect();
        let slices = breakdown_slices(&result);
        assert_eq!(slices[4].color, SLICE_COLORS[0]);
        assert_eq!(slices[4].percent, 20.0);
    }

    #[test]
    fn test_zero_total_gives_zero_percent() {
        let mut result = coffee();
        for stage in &mut result.breakdown {
            stage.liters = 0.0;
        }
        assert!(breakdown_slices(&result).iter().all(|s| s.percent == 0.0));
    }

    #[test]
    fn test_format_liters() {
        assert_eq!(format_liters(140.0), "140");
        assert_eq!(format_liters(15415.0), "15,415");
        assert_eq!(format_liters(2_700_000.0), "2,700,000");
        assert_eq!(format_liters(0.5), "0.5");
        assert_eq!(format_liters(1234.25), "1,234.3");
        assert_eq!(format_liters(-1500.0), "-1,500");
    }

    #[test]
    fn test_render_card() {
        let card = render_card(&coffee(), 20);
        assert!(card.starts_with("Coffee (1 cup)\n140 liters of water\n"));
        assert!(card.contains("about one minute of a running shower"));
        assert!(card.contains("Growing"));
        assert!(card.contains(" 93%"));
        assert!(card.contains("(10 L)"));
        assert_eq!(card.lines().filter(|l| l.contains('%')).count(), 2);
    }
}
