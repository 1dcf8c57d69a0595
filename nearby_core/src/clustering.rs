//! The "CLUSTERING" Engine - Zoom-Scaled Grid Grouping
//!
//! Groups the live peer set into map clusters:
//! 1. **Activation**: clustering only runs when the map is zoomed out past
//!    `zoom_cutoff` or when there are more than `peer_count_cutoff` peers.
//!    Otherwise every peer is its own singleton.
//! 2. **Gridding**: peers are binned into cells whose ground size tracks a
//!    fixed screen radius, so cells shrink as the zoom level increases.
//!    - `GridKind::Mercator`: square cells in Web-Mercator pixel space
//!    - `GridKind::Hex`: H3 cells at the finest resolution that still covers
//!      the screen radius at the viewport latitude
//! 3. **Aggregation**: a cell with one peer is a singleton; a cell with more
//!    is a cluster at the unweighted mean of its members.

use h3o::{LatLng, Resolution};
use nearby_env::{PeerId, Position};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;

use crate::tracking::TrackedPeer;

/// Equatorial circumference of the Web-Mercator sphere in meters.
const EARTH_CIRCUMFERENCE_M: f64 = 40_075_016.686;

/// Latitude limit of the Web-Mercator projection.
const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

const MAX_ZOOM: f64 = 24.0;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Grid used to bin peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridKind {
    Mercator,
    Hex,
}

/// Configuration for the clusterer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster when zoom is below this level (default: 12.0)
    pub zoom_cutoff: f64,

    /// Cluster when more than this many peers are placeable (default: 50)
    pub peer_count_cutoff: usize,

    /// Screen-space size of a grid cell in pixels (default: 64)
    pub cluster_radius_px: f64,

    /// Map tile size in pixels (default: 256)
    pub tile_size_px: f64,

    /// Grid used to bin peers (default: Mercator)
    pub grid: GridKind,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            zoom_cutoff: 12.0,
            peer_count_cutoff: 50,
            cluster_radius_px: 64.0,
            tile_size_px: 256.0,
            grid: GridKind::Mercator,
        }
    }
}

// ============================================================================
// OUTPUT
// ============================================================================

/// Per-pass identifier of a cluster. Carries no identity across passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClusterKey {
    /// Singleton wrapping exactly one peer
    Peer(PeerId),
    /// Web-Mercator grid cell
    Mercator { x: i64, y: i64 },
    /// H3 cell index
    Hex(u64),
}

/// A group of peers rendered as one map entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub key: ClusterKey,

    /// Unweighted mean of member positions
    pub centroid: Position,

    /// Member ids, sorted
    pub members: Vec<PeerId>,

    /// Members currently online
    pub online_count: usize,

    /// True when the cluster wraps exactly one peer
    pub is_singleton: bool,
}

impl Cluster {
    #[inline]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    fn singleton(id: PeerId, position: Position, online: bool) -> Self {
        Self {
            key: ClusterKey::Peer(id),
            centroid: position,
            members: vec![id],
            online_count: usize::from(online),
            is_singleton: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Member {
    id: PeerId,
    position: Position,
    online: bool,
}

// ============================================================================
// CLUSTERER
// ============================================================================

/// Stateless grid clusterer.
#[derive(Debug, Clone, Default)]
pub struct SpatialClusterer {
    config: ClusterConfig,
}

impl SpatialClusterer {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Whether grouping kicks in for this zoom and population.
    pub fn is_active(&self, zoom: f64, peer_count: usize) -> bool {
        zoom < self.config.zoom_cutoff || peer_count > self.config.peer_count_cutoff
    }

    /// Ground size in meters of one grid cell at `lat`.
    pub fn cell_size_m(&self, zoom: f64, lat: f64) -> f64 {
        let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
        let meters_per_px = EARTH_CIRCUMFERENCE_M * lat.cos() / world_size_px(&self.config, zoom);
        self.config.cluster_radius_px * meters_per_px
    }

    /// H3 resolution for the hex grid: the finest one whose edge still
    /// covers the cell size at the viewport latitude.
    pub fn hex_resolution(&self, zoom: f64, viewport_center: &Position) -> Resolution {
        let target_m = self.cell_size_m(zoom, viewport_center.lat);
        let mut chosen = Resolution::Zero;
        for level in 0u8..=15 {
            if let Ok(resolution) = Resolution::try_from(level) {
                if resolution.edge_length_m() >= target_m {
                    chosen = resolution;
                }
            }
        }
        chosen
    }

    /// Groups `peers` for the given viewport.
    ///
    /// Peers without a position are skipped (they stay tracked). Output
    /// ordering is deterministic but carries no meaning.
    pub fn cluster<'a, I>(&self, peers: I, zoom: f64, viewport_center: Position) -> Vec<Cluster>
    where
        I: IntoIterator<Item = &'a TrackedPeer>,
    {
        let zoom = if zoom.is_finite() { zoom.clamp(0.0, MAX_ZOOM) } else { 0.0 };

        let mut members = Vec::new();
        for peer in peers {
            match peer.position() {
                Some(position) => members.push(Member {
                    id: peer.id(),
                    position,
                    online: peer.is_online(),
                }),
                None => tracing::debug!("peer {} has no position, not clustered", peer.id()),
            }
        }

        if members.is_empty() {
            return Vec::new();
        }

        if !self.is_active(zoom, members.len()) {
            members.sort_by_key(|m| m.id);
            return members
                .into_iter()
                .map(|m| Cluster::singleton(m.id, m.position, m.online))
                .collect();
        }

        let resolution = match self.config.grid {
            GridKind::Hex => Some(self.hex_resolution(zoom, &viewport_center)),
            GridKind::Mercator => None,
        };

        let mut cells: BTreeMap<ClusterKey, Vec<Member>> = BTreeMap::new();
        for member in members {
            let key = match resolution {
                Some(resolution) => match hex_key(&member.position, resolution) {
                    Some(key) => key,
                    None => {
                        tracing::warn!("peer {} has an unindexable position, not clustered", member.id);
                        continue;
                    }
                },
                None => self.mercator_key(&member.position, zoom),
            };
            cells.entry(key).or_default().push(member);
        }

        let clusters: Vec<Cluster> = cells.into_iter().map(|(key, group)| build_cluster(key, group)).collect();

        tracing::debug!(
            "clustered at zoom {:.1}: {} clusters ({} multi-member)",
            zoom,
            clusters.len(),
            clusters.iter().filter(|c| !c.is_singleton).count()
        );

        clusters
    }

    fn mercator_key(&self, position: &Position, zoom: f64) -> ClusterKey {
        let (x, y) = project_mercator(position, world_size_px(&self.config, zoom));
        let cell = self.config.cluster_radius_px.max(1.0);
        ClusterKey::Mercator {
            x: (x / cell).floor() as i64,
            y: (y / cell).floor() as i64,
        }
    }
}

fn world_size_px(config: &ClusterConfig, zoom: f64) -> f64 {
    config.tile_size_px * 2f64.powf(zoom)
}

/// Projects a position to Web-Mercator world pixels at the given world size.
fn project_mercator(position: &Position, world_px: f64) -> (f64, f64) {
    let x = (position.lng + 180.0) / 360.0 * world_px;
    let lat = position.lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
    let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * world_px;
    (x, y)
}

fn hex_key(position: &Position, resolution: Resolution) -> Option<ClusterKey> {
    let lat_lng = LatLng::new(position.lat, position.lng).ok()?;
    Some(ClusterKey::Hex(u64::from(lat_lng.to_cell(resolution))))
}

fn build_cluster(key: ClusterKey, mut group: Vec<Member>) -> Cluster {
    // Sorted members make the centroid bit-identical for identical input
    group.sort_by_key(|m| m.id);

    if let [only] = group.as_slice() {
        return Cluster::singleton(only.id, only.position, only.online);
    }

    let positions: Vec<Position> = group.iter().map(|m| m.position).collect();
    Cluster {
        key,
        centroid: mean_position(&positions),
        online_count: group.iter().filter(|m| m.online).count(),
        members: group.into_iter().map(|m| m.id).collect(),
        is_singleton: false,
    }
}

/// Arithmetic mean of positions, unwrapping longitudes across the antimeridian.
pub fn mean_position(positions: &[Position]) -> Position {
    if positions.is_empty() {
        return Position::new(0.0, 0.0);
    }
    let n = positions.len() as f64;

    let (min_lng, max_lng) = positions
        .iter()
        .fold((f64::MAX, f64::MIN), |(lo, hi), p| (lo.min(p.lng), hi.max(p.lng)));
    let wraps = max_lng - min_lng > 180.0;

    let mut lat_sum = 0.0;
    let mut lng_sum = 0.0;
    for p in positions {
        lat_sum += p.lat;
        lng_sum += if wraps && p.lng < 0.0 { p.lng + 360.0 } else { p.lng };
    }

    let mut lng = lng_sum / n;
    if lng > 180.0 {
        lng -= 360.0;
    }
    Position::new(lat_sum / n, lng)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::ProximityRecord;
    use approx::assert_relative_eq;
    use nearby_env::PeerReport;
    use proptest::prelude::*;
    use std::collections::HashSet;

    /// Middle of a zoom-8 Mercator cell, far from any boundary.
    const CELL_CENTER: Position = Position::new(0.1757, 0.1758);

    fn peer(seed: u64, lat: f64, lng: f64) -> TrackedPeer {
        let report = PeerReport::new(PeerId::from_seed(seed), Position::new(lat, lng), 0);
        TrackedPeer::new(report, ProximityRecord::unknown(), 0)
    }

    /// `n` peers on a spiral of at most `radius_deg` around `center`.
    fn spiral(n: u64, center: Position, radius_deg: f64) -> Vec<TrackedPeer> {
        (0..n)
            .map(|i| {
                let r = radius_deg * (i as f64 + 1.0) / n as f64;
                let a = i as f64 * 2.399_963;
                peer(i, center.lat + r * a.sin(), center.lng + r * a.cos())
            })
            .collect()
    }

    fn assert_partition(peers: &[TrackedPeer], clusters: &[Cluster]) {
        let mut seen = HashSet::new();
        for cluster in clusters {
            assert_eq!(cluster.is_singleton, cluster.members.len() == 1);
            for id in &cluster.members {
                assert!(seen.insert(*id), "peer {} in two clusters", id);
            }
        }
        let placeable: HashSet<PeerId> = peers
            .iter()
            .filter(|p| p.position().is_some())
            .map(|p| p.id())
            .collect();
        assert_eq!(seen, placeable);
    }

    #[test]
    fn test_empty_input() {
        let clusterer = SpatialClusterer::default();
        let clusters = clusterer.cluster(std::iter::empty::<&TrackedPeer>(), 8.0, CELL_CENTER);
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_single_peer_is_singleton() {
        let clusterer = SpatialClusterer::default();
        let peers = vec![peer(1, 0.1, 0.1)];
        let clusters = clusterer.cluster(&peers, 3.0, CELL_CENTER);
        assert_eq!(clusters.len(), 1);
        assert!(clusters[0].is_singleton);
        assert_eq!(clusters[0].key, ClusterKey::Peer(PeerId::from_seed(1)));
    }

    #[test]
    fn test_zoomed_out_dense_group_clusters() {
        let clusterer = SpatialClusterer::default();
        // 1 km ≈ 0.009°
        let peers = spiral(30, CELL_CENTER, 0.008);
        let clusters = clusterer.cluster(&peers, 8.0, CELL_CENTER);

        assert!(clusters.len() < 30);
        assert!(clusters.iter().all(|c| !c.is_singleton));
        assert_partition(&peers, &clusters);
    }

    #[test]
    fn test_zoomed_in_sparse_group_stays_singletons() {
        let clusterer = SpatialClusterer::default();
        // 5 km ≈ 0.045°
        let peers = spiral(30, CELL_CENTER, 0.045);
        let clusters = clusterer.cluster(&peers, 18.0, CELL_CENTER);

        assert_eq!(clusters.len(), 30);
        assert!(clusters.iter().all(|c| c.is_singleton));
    }

    #[test]
    fn test_peer_count_cutoff_activates_clustering() {
        let clusterer = SpatialClusterer::default();
        let peers: Vec<TrackedPeer> = (0..60).map(|i| peer(i, 10.0, 10.0)).collect();
        let clusters = clusterer.cluster(&peers, 18.0, Position::new(10.0, 10.0));

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_count(), 60);
        assert_eq!(clusters[0].online_count, 60);
    }

    #[test]
    fn test_peer_without_position_excluded() {
        let clusterer = SpatialClusterer::default();
        let mut hidden = peer(2, 0.0, 0.0);
        hidden.report.position = None;
        let peers = vec![peer(1, 0.1, 0.1), hidden];

        let clusters = clusterer.cluster(&peers, 18.0, CELL_CENTER);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members, vec![PeerId::from_seed(1)]);
    }

    #[test]
    fn test_centroid_is_unweighted_mean() {
        let clusterer = SpatialClusterer::default();
        let mut offline = peer(2, 0.18, 0.18);
        offline.report.online = false;
        let peers = vec![peer(1, 0.17, 0.17), offline];

        let clusters = clusterer.cluster(&peers, 8.0, CELL_CENTER);
        assert_eq!(clusters.len(), 1);
        assert_relative_eq!(clusters[0].centroid.lat, 0.175, epsilon = 1e-12);
        assert_relative_eq!(clusters[0].centroid.lng, 0.175, epsilon = 1e-12);
        assert_eq!(clusters[0].online_count, 1);
    }

    #[test]
    fn test_cells_shrink_with_zoom() {
        let clusterer = SpatialClusterer::default();
        assert!(clusterer.cell_size_m(8.0, 0.0) > clusterer.cell_size_m(12.0, 0.0));
        assert!(clusterer.cell_size_m(12.0, 0.0) > clusterer.cell_size_m(18.0, 0.0));
        // 64 px at zoom 8 on the equator is ~39 km
        assert_relative_eq!(clusterer.cell_size_m(8.0, 0.0), 39_135.7, epsilon = 1.0);
    }

    #[test]
    fn test_hex_resolution_gets_finer_with_zoom() {
        let clusterer = SpatialClusterer::default();
        let coarse = clusterer.hex_resolution(6.0, &CELL_CENTER);
        let fine = clusterer.hex_resolution(16.0, &CELL_CENTER);
        assert!(u8::from(coarse) < u8::from(fine));
    }

    #[test]
    fn test_hex_grid_collapses_colocated_peers() {
        let clusterer = SpatialClusterer::new(ClusterConfig {
            grid: GridKind::Hex,
            ..Default::default()
        });
        let peers: Vec<TrackedPeer> = (0..10).map(|i| peer(i, 48.8566, 2.3522)).collect();
        let clusters = clusterer.cluster(&peers, 8.0, Position::new(48.8566, 2.3522));

        assert_eq!(clusters.len(), 1);
        assert!(matches!(clusters[0].key, ClusterKey::Hex(_)));
        assert_eq!(clusters[0].member_count(), 10);
    }

    #[test]
    fn test_mean_position_across_antimeridian() {
        let mean = mean_position(&[Position::new(0.0, 179.0), Position::new(0.0, -179.0)]);
        assert_relative_eq!(mean.lng.abs(), 180.0, epsilon = 1e-9);

        let mean = mean_position(&[Position::new(0.0, 170.0), Position::new(0.0, -178.0)]);
        assert_relative_eq!(mean.lng, 176.0, epsilon = 1e-9);
    }

    #[test]
    fn test_output_is_deterministic() {
        let clusterer = SpatialClusterer::default();
        let peers = spiral(40, CELL_CENTER, 0.5);
        let mut reversed = peers.clone();
        reversed.reverse();

        assert_eq!(
            clusterer.cluster(&peers, 7.0, CELL_CENTER),
            clusterer.cluster(&reversed, 7.0, CELL_CENTER)
        );
    }

    fn peer_set() -> impl Strategy<Value = Vec<TrackedPeer>> {
        prop::collection::vec((-60.0f64..60.0, -170.0f64..170.0, any::<bool>()), 0..120).prop_map(
            |coords| {
                coords
                    .into_iter()
                    .enumerate()
                    .map(|(i, (lat, lng, has_position))| {
                        let mut p = peer(i as u64, lat, lng);
                        if !has_position && i % 7 == 0 {
                            p.report.position = None;
                        }
                        p
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn prop_every_peer_in_exactly_one_cluster(peers in peer_set(), zoom in 0.0f64..20.0, hex in any::<bool>()) {
            let clusterer = SpatialClusterer::new(ClusterConfig {
                grid: if hex { GridKind::Hex } else { GridKind::Mercator },
                ..Default::default()
            });
            let clusters = clusterer.cluster(&peers, zoom, Position::new(0.0, 0.0));
            assert_partition(&peers, &clusters);
        }
    }
}
