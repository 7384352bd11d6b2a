//! Static report rendering.
//!
//! Both renderers only read an already computed result and write one PNG
//! file; they never touch the model. Text is drawn with a bundled DejaVu
//! Sans so output does not depend on fonts installed on the host.

use crate::errors::{PipelineError, PipelineResult};
use crate::prediction::{AttributionReport, FeatureContribution, PredictionResult};
use plotters::prelude::*;
use plotters::style::register_font;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;

const FONT_FAMILY: &str = "sans-serif";
static FONT_REGULAR: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");
static FONT_BOLD: &[u8] = include_bytes!("../assets/fonts/DejaVuSans-Bold.ttf");

const POSITIVE: RGBColor = RGBColor(255, 0, 81);
const NEGATIVE: RGBColor = RGBColor(0, 139, 251);
const AXIS: RGBColor = RGBColor(90, 90, 90);

const SUMMARY_SIZE: (u32, u32) = (900, 100);
const FORCE_SIZE: (u32, u32) = (1400, 320);
const FORCE_MARGIN: i32 = 60;
const AXIS_Y: i32 = 130;
const BAR_TOP: i32 = 150;
const BAR_HEIGHT: i32 = 30;
const ARROW: i32 = 8;

/// Register the bundled faces with plotters once per process.
fn ensure_fonts() -> PipelineResult<()> {
    static REGISTERED: OnceLock<Result<(), String>> = OnceLock::new();
    REGISTERED
        .get_or_init(|| {
            register_font(FONT_FAMILY, FontStyle::Normal, FONT_REGULAR)
                .map_err(|_| "regular face is not a valid font".to_string())?;
            register_font(FONT_FAMILY, FontStyle::Bold, FONT_BOLD)
                .map_err(|_| "bold face is not a valid font".to_string())
        })
        .clone()
        .map_err(|message| PipelineError::artifact_write("<bundled font>", message))
}

fn write_error<E: std::fmt::Display>(path: &Path) -> impl Fn(E) -> PipelineError + '_ {
    move |e| PipelineError::artifact_write(path.display().to_string(), e.to_string())
}

/// Write the one-line probability summary.
pub fn render_prediction_summary(result: &PredictionResult, path: &Path) -> PipelineResult<()> {
    ensure_fonts()?;
    let text = result.summary_text();
    {
        let root = BitMapBackend::new(path, SUMMARY_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(write_error(path))?;
        let style = (FONT_FAMILY, 24)
            .into_font()
            .color(&BLACK)
            .pos(Pos::new(HPos::Center, VPos::Center));
        root.draw(&Text::new(
            text.clone(),
            (SUMMARY_SIZE.0 as i32 / 2, SUMMARY_SIZE.1 as i32 / 2),
            style,
        ))
        .map_err(write_error(path))?;
        root.present().map_err(write_error(path))?;
    }
    info!(path = %path.display(), "{}", text);
    Ok(())
}

/// Horizontal value axis shared by every element of the force plot.
struct ForceAxis {
    lo: f64,
    hi: f64,
}

impl ForceAxis {
    fn new(report: &AttributionReport) -> Self {
        let output = report.output_value();
        let positive: f64 = report
            .contributions
            .iter()
            .filter(|c| c.contribution > 0.0)
            .map(|c| c.contribution)
            .sum();
        let negative: f64 = report
            .contributions
            .iter()
            .filter(|c| c.contribution < 0.0)
            .map(|c| -c.contribution)
            .sum();
        let mut lo = (output - positive).min(report.baseline);
        let mut hi = (output + negative).max(report.baseline);
        let pad = ((hi - lo) * 0.1).max(1e-3);
        lo -= pad;
        hi += pad;
        Self { lo, hi }
    }

    fn px(&self, value: f64) -> i32 {
        let width = (FORCE_SIZE.0 as i32 - 2 * FORCE_MARGIN) as f64;
        FORCE_MARGIN + ((value - self.lo) / (self.hi - self.lo) * width).round() as i32
    }

    fn ticks(&self) -> Vec<f64> {
        let n = 6;
        (0..=n)
            .map(|i| self.lo + (self.hi - self.lo) * i as f64 / n as f64)
            .collect()
    }
}

/// A chevron pointing right (towards higher output) or left.
fn chevron(x0: i32, x1: i32, pointing_right: bool) -> Vec<(i32, i32)> {
    let top = BAR_TOP;
    let bottom = BAR_TOP + BAR_HEIGHT;
    let mid = BAR_TOP + BAR_HEIGHT / 2;
    let tip = ARROW.min((x1 - x0).max(1));
    if pointing_right {
        vec![
            (x0, top),
            (x1 - tip, top),
            (x1, mid),
            (x1 - tip, bottom),
            (x0, bottom),
            (x0 + tip, mid),
        ]
    } else {
        vec![
            (x0 + tip, top),
            (x1, top),
            (x1 - tip, mid),
            (x1, bottom),
            (x0 + tip, bottom),
            (x0, mid),
        ]
    }
}

/// Write a force-plot style chart: positive contributions (red) push the
/// output up from the left, negative ones (blue) push it down from the right.
pub fn render_attribution_plot(report: &AttributionReport, path: &Path) -> PipelineResult<()> {
    ensure_fonts()?;
    let axis = ForceAxis::new(report);
    let output = report.output_value();
    let ranked = report.ranked();

    let root = BitMapBackend::new(path, FORCE_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(write_error(path))?;

    let title = (FONT_FAMILY, 18).into_font().color(&BLACK).pos(Pos::new(HPos::Center, VPos::Top));
    root.draw(&Text::new(
        format!("Attribution for class {}", report.explained_class),
        (FORCE_SIZE.0 as i32 / 2, 12),
        title,
    ))
    .map_err(write_error(path))?;

    // Value axis with ticks.
    root.draw(&PathElement::new(
        vec![(FORCE_MARGIN, AXIS_Y), (FORCE_SIZE.0 as i32 - FORCE_MARGIN, AXIS_Y)],
        AXIS.stroke_width(1),
    ))
    .map_err(write_error(path))?;
    let tick_style = (FONT_FAMILY, 12).into_font().color(&AXIS).pos(Pos::new(HPos::Center, VPos::Bottom));
    for tick in axis.ticks() {
        let x = axis.px(tick);
        root.draw(&PathElement::new(vec![(x, AXIS_Y - 4), (x, AXIS_Y + 4)], AXIS.stroke_width(1)))
            .map_err(write_error(path))?;
        root.draw(&Text::new(format!("{tick:.2}"), (x, AXIS_Y - 6), tick_style.clone()))
            .map_err(write_error(path))?;
    }

    // Positive segments stack leftwards from the output, largest nearest it.
    let positives: Vec<&FeatureContribution> =
        ranked.iter().copied().filter(|c| c.contribution > 0.0).collect();
    let negatives: Vec<&FeatureContribution> =
        ranked.iter().copied().filter(|c| c.contribution < 0.0).collect();

    let label_style = (FONT_FAMILY, 12).into_font().color(&BLACK).pos(Pos::new(HPos::Center, VPos::Top));
    let mut label_row = 0;
    let mut draw_segment = |c: &FeatureContribution, from: f64, to: f64, right: bool| -> PipelineResult<()> {
        let (x0, x1) = (axis.px(from.min(to)), axis.px(from.max(to)));
        let color = if right { POSITIVE } else { NEGATIVE };
        root.draw(&Polygon::new(chevron(x0, x1, right), color.filled()))
            .map_err(write_error(path))?;
        if x1 - x0 >= 4 {
            let y = BAR_TOP + BAR_HEIGHT + 8 + 16 * (label_row % 4);
            label_row += 1;
            root.draw(&Text::new(
                format!("{} = {}", c.feature, c.display_value),
                ((x0 + x1) / 2, y),
                label_style.clone(),
            ))
            .map_err(write_error(path))?;
        }
        Ok(())
    };

    let mut cursor = output;
    for &c in &positives {
        draw_segment(c, cursor - c.contribution, cursor, true)?;
        cursor -= c.contribution;
    }
    let mut cursor = output;
    for &c in &negatives {
        draw_segment(c, cursor, cursor - c.contribution, false)?;
        cursor -= c.contribution;
    }

    // Output and baseline markers.
    let marker = (FONT_FAMILY, 16)
        .into_font()
        .style(FontStyle::Bold)
        .color(&BLACK)
        .pos(Pos::new(HPos::Center, VPos::Bottom));
    let fx = axis.px(output);
    root.draw(&Text::new(format!("f(x) = {output:.2}"), (fx, AXIS_Y - 28), marker))
        .map_err(write_error(path))?;
    let base_style = (FONT_FAMILY, 13).into_font().color(&AXIS).pos(Pos::new(HPos::Center, VPos::Bottom));
    let bx = axis.px(report.baseline);
    root.draw(&PathElement::new(vec![(bx, AXIS_Y - 18), (bx, AXIS_Y)], AXIS.stroke_width(1)))
        .map_err(write_error(path))?;
    root.draw(&Text::new(
        format!("base value {:.2}", report.baseline),
        (bx, AXIS_Y - 50),
        base_style,
    ))
    .map_err(write_error(path))?;

    root.present().map_err(write_error(path))?;
    info!(path = %path.display(), features = report.contributions.len(), "attribution plot written");
    Ok(())
}
