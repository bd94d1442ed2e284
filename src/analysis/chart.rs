use super::TransactionAnalysis;
use base64::Engine;
use serde::Serialize;
use std::f64::consts::PI;
use std::fmt::Write;

pub const HISTOGRAM_BINS: usize = 30;

const WIDTH: f64 = 1400.0;
const HEIGHT: f64 = 1000.0;
const PIE_RADIUS: f64 = 170.0;

const PALETTE: [&str; 10] = [
    "#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b", "#e377c2", "#7f7f7f", "#bcbd22",
    "#17becf",
];

/// A rendered analysis figure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chart {
    pub svg: String,
}

impl Chart {
    pub const FORMAT: &'static str = "svg";

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.svg.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    /// `counts.len() + 1` ascending bin edges.
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
}

/// Equal-width bins over the value range; the last bin is closed on the right.
pub fn histogram(values: &[f64], bins: usize) -> Option<Histogram> {
    let bins = bins.max(1);
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let mut lo = finite.iter().copied().reduce(f64::min)?;
    let mut hi = finite.iter().copied().reduce(f64::max)?;
    if lo == hi {
        lo -= 0.5;
        hi += 0.5;
    }

    let width = (hi - lo) / bins as f64;
    let edges = (0..=bins)
        .map(|i| if i == bins { hi } else { lo + width * i as f64 })
        .collect();
    let mut counts = vec![0; bins];
    for v in finite {
        let idx = (((v - lo) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    Some(Histogram { edges, counts })
}

/// Two pies (countries, top counterparties) over an amount histogram.
pub fn render_analysis_chart(analysis: &TransactionAnalysis) -> Chart {
    let mut svg = String::new();
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}" font-family="sans-serif">"#
    );
    svg.push_str(r#"<rect width="100%" height="100%" fill="white"/>"#);

    pie_panel(
        &mut svg,
        WIDTH * 0.25,
        HEIGHT * 0.25,
        "Transactions by Country",
        &analysis.countries,
    );
    let ibans_title = if analysis.counterparties.is_empty() {
        "Top External IBANs"
    } else {
        "Top External IBANs (Top 10)"
    };
    pie_panel(
        &mut svg,
        WIDTH * 0.75,
        HEIGHT * 0.25,
        ibans_title,
        &analysis.counterparties,
    );
    histogram_panel(&mut svg, &analysis.amounts);

    svg.push_str("</svg>");
    Chart { svg }
}

fn pie_panel(svg: &mut String, cx: f64, cy: f64, title: &str, slices: &[(String, usize)]) {
    title_text(svg, cx, cy - PIE_RADIUS - 45.0, title);

    let total: usize = slices.iter().map(|(_, n)| n).sum();
    if total == 0 {
        no_data(svg, cx, cy);
        return;
    }

    // counter-clockwise from twelve o'clock
    let mut angle = PI / 2.0;
    for (i, (label, count)) in slices.iter().enumerate() {
        let share = *count as f64 / total as f64;
        let sweep = share * 2.0 * PI;
        let color = PALETTE[i % PALETTE.len()];

        if slices.len() == 1 {
            let _ = write!(
                svg,
                r#"<circle cx="{cx:.2}" cy="{cy:.2}" r="{PIE_RADIUS}" fill="{color}"/>"#
            );
        } else {
            let (x0, y0) = polar(cx, cy, PIE_RADIUS, angle);
            let (x1, y1) = polar(cx, cy, PIE_RADIUS, angle + sweep);
            let large_arc = u8::from(sweep > PI);
            let _ = write!(
                svg,
                r#"<path d="M {cx:.2} {cy:.2} L {x0:.2} {y0:.2} A {PIE_RADIUS} {PIE_RADIUS} 0 {large_arc} 0 {x1:.2} {y1:.2} Z" fill="{color}"/>"#
            );
        }

        let mid = angle + sweep / 2.0;
        let (lx, ly) = polar(cx, cy, PIE_RADIUS * 1.12, mid);
        let anchor = if lx < cx { "end" } else { "start" };
        let _ = write!(
            svg,
            r#"<text x="{lx:.2}" y="{ly:.2}" font-size="13" text-anchor="{anchor}">{}</text>"#,
            escape(label)
        );
        let (px, py) = polar(cx, cy, PIE_RADIUS * 0.6, mid);
        let _ = write!(
            svg,
            r#"<text x="{px:.2}" y="{py:.2}" font-size="12" text-anchor="middle">{:.1}%</text>"#,
            share * 100.0
        );
        angle += sweep;
    }
}

fn histogram_panel(svg: &mut String, amounts: &[f64]) {
    let (left, top, width, height) = (110.0, 600.0, WIDTH - 180.0, 320.0);
    title_text(svg, WIDTH / 2.0, top - 30.0, "Transaction Amounts Distribution");

    let Some(hist) = histogram(amounts, HISTOGRAM_BINS) else {
        no_data(svg, WIDTH / 2.0, top + height / 2.0);
        return;
    };

    let peak = hist.counts.iter().copied().max().unwrap_or(0).max(1) as f64;
    let bar_width = width / hist.counts.len() as f64;
    for (i, count) in hist.counts.iter().enumerate() {
        let h = *count as f64 / peak * height;
        let x = left + bar_width * i as f64;
        let y = top + height - h;
        let _ = write!(
            svg,
            r#"<rect x="{x:.2}" y="{y:.2}" width="{bar_width:.2}" height="{h:.2}" fill="orange" stroke="black" stroke-width="1"/>"#
        );
    }

    let bottom = top + height;
    let _ = write!(
        svg,
        r#"<line x1="{left}" y1="{bottom}" x2="{}" y2="{bottom}" stroke="black"/><line x1="{left}" y1="{top}" x2="{left}" y2="{bottom}" stroke="black"/>"#,
        left + width
    );

    let lo = hist.edges[0];
    let hi = hist.edges[hist.edges.len() - 1];
    for step in 0..=4 {
        let frac = step as f64 / 4.0;
        let x = left + width * frac;
        let _ = write!(
            svg,
            r#"<text x="{x:.2}" y="{}" font-size="12" text-anchor="middle">{}</text>"#,
            bottom + 18.0,
            tick_label(lo + (hi - lo) * frac)
        );
        let y = bottom - height * frac;
        let _ = write!(
            svg,
            r#"<text x="{}" y="{y:.2}" font-size="12" text-anchor="end">{}</text>"#,
            left - 8.0,
            tick_label(peak * frac)
        );
    }

    let _ = write!(
        svg,
        r#"<text x="{}" y="{}" font-size="14" text-anchor="middle">Amount</text>"#,
        left + width / 2.0,
        bottom + 45.0
    );
    let _ = write!(
        svg,
        r#"<text x="40" y="{mid}" font-size="14" text-anchor="middle" transform="rotate(-90 40 {mid})">Frequency</text>"#,
        mid = top + height / 2.0
    );
}

fn title_text(svg: &mut String, x: f64, y: f64, title: &str) {
    let _ = write!(
        svg,
        r#"<text x="{x:.2}" y="{y:.2}" font-size="18" text-anchor="middle">{}</text>"#,
        escape(title)
    );
}

fn no_data(svg: &mut String, x: f64, y: f64) {
    let _ = write!(
        svg,
        r#"<text x="{x:.2}" y="{y:.2}" font-size="16" text-anchor="middle">No data</text>"#
    );
}

/// Screen coordinates for a math-convention angle.
fn polar(cx: f64, cy: f64, r: f64, angle: f64) -> (f64, f64) {
    (cx + r * angle.cos(), cy - r * angle.sin())
}

fn tick_label(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e12 {
        format!("{}", v as i64)
    } else {
        format!("{v:.1}")
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
