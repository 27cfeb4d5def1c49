//! Color ramp for the choropleth.
//!
//! The numeric range runs from the no-data sentinel up to the highest real
//! price. The sentinel sits at ramp position 0 in a neutral color; the
//! gradient starts exactly at the lowest real price, and a gap of at least
//! [`EPSILON`] (clamped at 0) separates the two, so no real price can pick
//! up the no-data color.

use crate::config::ScaleConfig;
use crate::error::{DashboardError, DashboardResult};
use crate::types::{RegionPrice, SENTINEL_NO_DATA};
use serde::{Deserialize, Serialize, Serializer};

pub const EPSILON: f64 = 0.001;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ramp {
    #[default]
    ThreeStop,
    FiveStop,
}

impl Ramp {
    pub fn default_colors(&self) -> Vec<Color> {
        let hex: &[&str] = match self {
            Ramp::ThreeStop => &["#2d7f2e", "#ffeb84", "#d73027"],
            Ramp::FiveStop => &["#2d7f2e", "#a6d96a", "#ffeb84", "#fdae61", "#d73027"],
        };
        hex.iter().filter_map(|h| Color::from_hex(h)).collect()
    }

    pub fn stop_count(&self) -> usize {
        match self {
            Ramp::ThreeStop => 3,
            Ramp::FiveStop => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color(pub [u8; 3]);

impl Color {
    pub const NEUTRAL: Color = Color([0xd3, 0xd3, 0xd3]);

    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(Color([r, g, b]))
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2])
    }

    fn lerp(a: Color, b: Color, t: f64) -> Color {
        let mix = |x: u8, y: u8| (x as f64 + (y as f64 - x as f64) * t).round() as u8;
        Color([mix(a.0[0], b.0[0]), mix(a.0[1], b.0[1]), mix(a.0[2], b.0[2])])
    }
}

impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColorStop {
    pub position: f64,
    pub color: Color,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tick {
    pub value: f64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColorScale {
    /// `[SENTINEL_NO_DATA, max real price]`.
    pub range: (f64, f64),
    pub stops: Vec<ColorStop>,
    pub ticks: Vec<Tick>,
    pub no_data: Color,
    #[serde(skip)]
    gradient: Vec<Color>,
    #[serde(skip)]
    real_range: Option<(f64, f64)>,
}

impl ColorScale {
    pub fn build(prices: &[f64], ramp: Ramp) -> Self {
        Self::with_colors(prices, ramp.default_colors(), Color::NEUTRAL)
    }

    pub fn from_config(prices: &[f64], config: &ScaleConfig) -> DashboardResult<Self> {
        let gradient = match &config.colors {
            Some(colors) => {
                if colors.len() != config.ramp.stop_count() {
                    return Err(DashboardError::Config(format!(
                        "scale.colors needs {} colors for {:?}, got {}",
                        config.ramp.stop_count(),
                        config.ramp,
                        colors.len()
                    )));
                }
                colors
                    .iter()
                    .map(|c| parse_color(c))
                    .collect::<DashboardResult<Vec<_>>>()?
            }
            None => config.ramp.default_colors(),
        };
        let no_data = parse_color(&config.no_data_color)?;
        Ok(Self::with_colors(prices, gradient, no_data))
    }

    /// `prices` must be real prices only; non-finite or negative values
    /// are ignored.
    pub fn with_colors(prices: &[f64], gradient: Vec<Color>, no_data: Color) -> Self {
        let real_range = prices
            .iter()
            .copied()
            .filter(|p| p.is_finite() && *p >= 0.0)
            .fold(None, |acc: Option<(f64, f64)>, p| match acc {
                None => Some((p, p)),
                Some((lo, hi)) => Some((lo.min(p), hi.max(p))),
            });

        let (min, max) = match real_range {
            Some(range) => range,
            None => {
                return Self {
                    range: (SENTINEL_NO_DATA, 0.0),
                    stops: vec![
                        ColorStop { position: 0.0, color: no_data },
                        ColorStop { position: 1.0, color: no_data },
                    ],
                    ticks: Vec::new(),
                    no_data,
                    gradient,
                    real_range: None,
                };
            }
        };

        let span = max - SENTINEL_NO_DATA;
        let position = |v: f64| (v - SENTINEL_NO_DATA) / span;
        let start = position(min);

        let mut stops = vec![
            ColorStop { position: 0.0, color: no_data },
            ColorStop {
                position: (start - EPSILON).max(0.0),
                color: no_data,
            },
        ];
        let last = gradient.len().saturating_sub(1);
        for (i, color) in gradient.iter().enumerate() {
            let position = if i == last {
                1.0
            } else {
                start + (1.0 - start) * (i as f64 / last as f64)
            };
            stops.push(ColorStop {
                position,
                color: *color,
            });
        }

        let ticks = if min == max {
            vec![tick(min)]
        } else {
            vec![tick(min), tick((min + max) / 2.0), tick(max)]
        };

        Self {
            range: (SENTINEL_NO_DATA, max),
            stops,
            ticks,
            no_data,
            gradient,
            real_range: Some((min, max)),
        }
    }

    /// Position of a value on the `[0, 1]` ramp.
    pub fn position(&self, value: f64) -> f64 {
        let (lo, hi) = self.range;
        ((value - lo) / (hi - lo)).clamp(0.0, 1.0)
    }

    pub fn real_range(&self) -> Option<(f64, f64)> {
        self.real_range
    }

    pub fn color_for(&self, price: RegionPrice) -> Color {
        let (value, min, max) = match (price, self.real_range) {
            (RegionPrice::Present(v), Some((min, max))) => (v, min, max),
            _ => return self.no_data,
        };
        let t = if max > min {
            ((value - min) / (max - min)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        gradient_at(&self.gradient, t).unwrap_or(self.no_data)
    }
}

fn tick(value: f64) -> Tick {
    Tick {
        value,
        label: format!("{:.0}", value),
    }
}

fn parse_color(hex: &str) -> DashboardResult<Color> {
    Color::from_hex(hex)
        .ok_or_else(|| DashboardError::Config(format!("Invalid hex color '{}'", hex)))
}

fn gradient_at(gradient: &[Color], t: f64) -> Option<Color> {
    match gradient.len() {
        0 => None,
        1 => Some(gradient[0]),
        n => {
            let scaled = t * (n - 1) as f64;
            let i = (scaled.floor() as usize).min(n - 2);
            Some(Color::lerp(gradient[i], gradient[i + 1], scaled - i as f64))
        }
    }
}
