//! cluster.rs
//! Temporal clustering of time-sorted pixel hits and spatial grading of
//! each cluster against the 3×3 X-ray pattern table.
//!
//! A cluster is a maximal run of hits in which every member arrives
//! within [`CLUSTER_WINDOW_TICKS`] of the previous one. Grading assigns
//! each member a bit weight by its offset from the highest-energy member
//! and looks the weight sum up in a fixed table; anything too large, too
//! spread out, or unmatched is the outlier grade.

use crate::acquisition::device::PixelHit;
use crate::processing::calibration::EnergyCalib;

/// Grade assigned to clusters that cannot be an X-ray.
pub const OUTLIER_GRADE: u8 = 7;

/// Device ticks a cluster stays open after its latest member.
pub const CLUSTER_WINDOW_TICKS: u64 = 5;

/// Clusters with more members than this cannot be an X-ray.
const MAX_CLUSTER_HITS: usize = 9;

/// A graded cluster event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeciesHit {
    pub grade: u8,
    pub start_toa: u64,
    pub end_toa: u64,
    pub total_energy: f64,
}

/// Bit weight of a member at offset (dx, dy) from the cluster center,
/// rows top (dy = +1) to bottom (dy = -1), columns dx = -1, 0, +1.
/// The center itself contributes 0.
const GRID_WEIGHT: [[u16; 3]; 3] = [
    [32, 64, 128],
    [8, 0, 16],
    [1, 2, 4],
];

/// Weight-sum → grade lookup. Sums not present map to the outlier grade.
static GRADE_BY_SUM: [u8; 256] = build_grade_table();

const fn build_grade_table() -> [u8; 256] {
    const G1: [u8; 15] = [
        1, 4, 32, 128, 5, 33, 132, 160, 36, 129, 37, 133, 161, 164, 165,
    ];
    const G2: [u8; 8] = [64, 65, 68, 69, 2, 34, 130, 162];
    const G3: [u8; 4] = [8, 12, 136, 140];
    const G4: [u8; 4] = [16, 17, 48, 49];
    const G5: [u8; 32] = [
        3, 6, 9, 20, 40, 96, 144, 192, 13, 21, 35, 38, 44, 52, 97, 100, 131, 134, 137, 145, 168,
        176, 193, 196, 53, 101, 141, 163, 166, 172, 177, 197,
    ];
    const G6: [u8; 16] = [
        72, 76, 104, 108, 10, 11, 138, 139, 18, 22, 50, 54, 80, 81, 208, 209,
    ];

    let mut table = [OUTLIER_GRADE; 256];
    table[0] = 0;
    let mut i = 0;
    while i < G1.len() {
        table[G1[i] as usize] = 1;
        i += 1;
    }
    i = 0;
    while i < G2.len() {
        table[G2[i] as usize] = 2;
        i += 1;
    }
    i = 0;
    while i < G3.len() {
        table[G3[i] as usize] = 3;
        i += 1;
    }
    i = 0;
    while i < G4.len() {
        table[G4[i] as usize] = 4;
        i += 1;
    }
    i = 0;
    while i < G5.len() {
        table[G5[i] as usize] = 5;
        i += 1;
    }
    i = 0;
    while i < G6.len() {
        table[G6[i] as usize] = 6;
        i += 1;
    }
    table
}

/// Grades one cluster. `members` includes the center (the max-energy
/// hit), which contributes weight 0.
fn cluster_grade(members: &[PixelHit], center: &PixelHit) -> u8 {
    if members.len() > MAX_CLUSTER_HITS {
        return OUTLIER_GRADE;
    }

    let mut sum: u16 = 0;
    for hit in members {
        let dx = i16::from(hit.x) - i16::from(center.x);
        if dx.abs() > 1 {
            return OUTLIER_GRADE;
        }
        let dy = i16::from(hit.y) - i16::from(center.y);
        if dy.abs() > 1 {
            return OUTLIER_GRADE;
        }
        sum += GRID_WEIGHT[(1 - dy) as usize][(dx + 1) as usize];
    }

    // duplicate-coordinate members can push the sum past any valid pattern
    if sum > 255 {
        return OUTLIER_GRADE;
    }
    GRADE_BY_SUM[sum as usize]
}

/// Sorts `hits` by time of arrival, walks them into clusters with the
/// 5-tick window rule and returns one graded [`SpeciesHit`] per cluster,
/// in time order.
///
/// The window upper bound is strict, so hits with identical `toa` always
/// share a cluster. The emitted `end_toa` is the `toa` of the cluster's
/// last member.
pub fn grade_clusters(hits: &mut [PixelHit], calib: &EnergyCalib) -> Vec<SpeciesHit> {
    if hits.is_empty() {
        return Vec::new();
    }

    hits.sort_unstable_by_key(|h| h.toa);

    let mut species = Vec::new();
    let mut start = 0usize;
    let mut max_e_idx = 0usize;
    let mut start_toa = hits[0].toa;
    let mut max_toa = start_toa + CLUSTER_WINDOW_TICKS;
    let mut max_energy = calib.energy(&hits[0]);
    let mut total_energy = max_energy;

    for i in 1..hits.len() {
        let hit = hits[i];
        if hit.toa < max_toa {
            // hit belongs to the open cluster
            max_toa = hit.toa + CLUSTER_WINDOW_TICKS;
            let cur_e = calib.energy(&hit);
            total_energy += cur_e;
            if cur_e > max_energy {
                max_e_idx = i;
                max_energy = cur_e;
            }
        } else {
            species.push(SpeciesHit {
                grade: cluster_grade(&hits[start..i], &hits[max_e_idx]),
                start_toa,
                end_toa: max_toa - CLUSTER_WINDOW_TICKS,
                total_energy,
            });

            start = i;
            max_e_idx = i;
            start_toa = hit.toa;
            max_toa = start_toa + CLUSTER_WINDOW_TICKS;
            max_energy = calib.energy(&hit);
            total_energy = max_energy;
        }
    }

    species.push(SpeciesHit {
        grade: cluster_grade(&hits[start..], &hits[max_e_idx]),
        start_toa,
        end_toa: max_toa - CLUSTER_WINDOW_TICKS,
        total_energy,
    });

    species
}
