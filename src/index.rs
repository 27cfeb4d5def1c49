use crate::data::BoundaryDocument;
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::centroid::Centroid;
use geo::algorithm::contains::Contains;
use geo::{Point, Rect};
use rstar::{RTree, RTreeObject, AABB};
use serde::Serialize;

// Wrapper for RTree indexing; `index` points into the boundary features.
struct RegionEnvelope {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for RegionEnvelope {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Point-in-region lookup over a boundary document.
pub struct RegionIndex {
    tree: RTree<RegionEnvelope>,
    bounds: Option<Rect<f64>>,
}

impl RegionIndex {
    pub fn build(boundary: &BoundaryDocument) -> Self {
        let mut bounds: Option<Rect<f64>> = None;
        let items: Vec<RegionEnvelope> = boundary
            .features
            .iter()
            .enumerate()
            .filter_map(|(i, feature)| {
                // Empty geometries have no extent and never match a point.
                let rect = feature.geometry.bounding_rect()?;
                bounds = Some(match bounds {
                    None => rect,
                    Some(b) => Rect::new(
                        geo::Coord {
                            x: b.min().x.min(rect.min().x),
                            y: b.min().y.min(rect.min().y),
                        },
                        geo::Coord {
                            x: b.max().x.max(rect.max().x),
                            y: b.max().y.max(rect.max().y),
                        },
                    ),
                });
                Some(RegionEnvelope {
                    index: i,
                    aabb: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                })
            })
            .collect();

        Self {
            tree: RTree::bulk_load(items),
            bounds,
        }
    }

    /// Index of the feature containing `(lon, lat)`. Where features
    /// overlap, the earliest in document order wins.
    pub fn locate(&self, boundary: &BoundaryDocument, lon: f64, lat: f64) -> Option<usize> {
        let point = Point::new(lon, lat);
        let envelope = AABB::from_point([lon, lat]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .filter(|candidate| {
                boundary
                    .features
                    .get(candidate.index)
                    .map_or(false, |f| f.geometry.contains(&point))
            })
            .map(|candidate| candidate.index)
            .min()
    }

    /// Extent of every non-empty feature.
    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.bounds
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub lon: f64,
    pub lat: f64,
}

/// Centroid of every feature, in document order; `None` for empty geometry.
pub fn centroids(boundary: &BoundaryDocument) -> Vec<Option<Coordinates>> {
    boundary
        .features
        .iter()
        .map(|f| {
            f.geometry.centroid().map(|p| Coordinates {
                lon: p.x(),
                lat: p.y(),
            })
        })
        .collect()
}
