//! Descriptor matching between frames, keyframes and landmarks.
//!
//! Four search modes feed the tracking cascade: projection from the last
//! frame (motion model), projection of local-map candidates, joint
//! bag-of-words walk against a keyframe, and the epipolar search used by the
//! mapper for triangulation. `fuse` merges duplicated landmarks after
//! neighbor projection.
//!
//! Matching never touches the shared map: callers snapshot the landmark data
//! they need into the view structs below and release the map lock before
//! calling in. Only `fuse` mutates the map and runs on the mapper side under
//! the write lock.

use std::collections::HashSet;
use std::sync::Arc;

use nalgebra::{Matrix3, Vector2, Vector3, Vector4};

use crate::frame::camera::CameraModel;
use crate::frame::descriptor::Descriptor;
use crate::frame::features::{KeyPoint, ScalePyramid};
use crate::frame::Frame;
use crate::geometry::{skew, SE3};
use crate::map::{KeyFrameId, Map, MapLineId, MapPlaneId, MapPointId};
use crate::vocabulary::FeatureVector;

/// Loose Hamming threshold for projection-based searches.
pub const TH_HIGH: u32 = 100;
/// Strict Hamming threshold for BoW and fuse searches.
pub const TH_LOW: u32 = 50;
/// Number of rotation-consistency histogram bins over [0, 360) degrees.
pub const HISTO_LENGTH: usize = 30;

/// Landmark data copied out of the map for lock-free matching.
#[derive(Debug, Clone)]
pub struct MapPointView {
    pub id: MapPointId,
    pub position: Vector3<f64>,
    pub descriptor: Descriptor,
    pub n_observations: usize,
}

/// A local-map landmark that passed the frustum test, with its cached
/// projection into the current frame.
#[derive(Debug, Clone)]
pub struct TrackCandidate {
    pub id: MapPointId,
    pub descriptor: Descriptor,
    pub proj_x: f64,
    pub proj_y: f64,
    /// Projected virtual right coordinate.
    pub proj_xr: f64,
    pub predicted_level: usize,
    pub view_cos: f64,
}

/// Snapshot of a keyframe for the joint bag-of-words search.
#[derive(Debug, Clone)]
pub struct KeyFrameBowView {
    pub feature_vector: FeatureVector,
    pub descriptors: Vec<Descriptor>,
    pub keypoint_angles: Vec<f32>,
    /// Landmark per keypoint slot; `None` where there is none or it is bad.
    pub map_points: Vec<Option<MapPointView>>,
}

/// Snapshot of a keyframe for the epipolar triangulation search.
#[derive(Debug, Clone)]
pub struct KeyFrameEpipolarView {
    pub feature_vector: FeatureVector,
    pub descriptors: Vec<Descriptor>,
    pub keypoints: Vec<KeyPoint>,
    pub u_right: Vec<f32>,
    pub has_map_point: Vec<bool>,
    pub pose_cw: SE3,
    pub camera: CameraModel,
    pub pyramid: Arc<ScalePyramid>,
}

/// A local-map line candidate with its endpoints projected into the frame.
#[derive(Debug, Clone)]
pub struct LineCandidate {
    pub id: MapLineId,
    pub descriptor: Descriptor,
    pub start_proj: Vector2<f64>,
    pub end_proj: Vector2<f64>,
}

/// A map plane candidate in world coordinates.
#[derive(Debug, Clone)]
pub struct PlaneCandidate {
    pub id: MapPlaneId,
    pub coeffs_world: Vector4<f64>,
}

/// Window radius as a function of the viewing angle: nearly head-on
/// observations project precisely, slanted ones need a wider window.
pub fn radius_by_viewing_cos(view_cos: f64) -> f64 {
    if view_cos > 0.998 {
        2.5
    } else {
        4.0
    }
}

/// Fundamental matrix `F12` such that `x1' F12 x2 = 0`, from the two camera
/// poses: `F12 = K1^-T [t12]x R12 K2^-1`.
pub fn fundamental_between(
    pose1_cw: &SE3,
    camera1: &CameraModel,
    pose2_cw: &SE3,
    camera2: &CameraModel,
) -> Matrix3<f64> {
    let r1w = pose1_cw.rotation_matrix();
    let t1w = pose1_cw.translation;
    let r2w = pose2_cw.rotation_matrix();
    let t2w = pose2_cw.translation;

    let r12 = r1w * r2w.transpose();
    let t12 = -r12 * t2w + t1w;

    let k1_inv_t = Matrix3::new(
        1.0 / camera1.fx,
        0.0,
        0.0,
        0.0,
        1.0 / camera1.fy,
        0.0,
        -camera1.cx / camera1.fx,
        -camera1.cy / camera1.fy,
        1.0,
    );
    let k2_inv = Matrix3::new(
        1.0 / camera2.fx,
        0.0,
        -camera2.cx / camera2.fx,
        0.0,
        1.0 / camera2.fy,
        -camera2.cy / camera2.fy,
        0.0,
        0.0,
        1.0,
    );
    k1_inv_t * skew(&t12) * r12 * k2_inv
}

pub struct Matcher {
    nn_ratio: f32,
    check_orientation: bool,
}

impl Matcher {
    pub fn new(nn_ratio: f32, check_orientation: bool) -> Self {
        Self {
            nn_ratio,
            check_orientation,
        }
    }

    // ── Mode 1: projection from the last frame (motion model) ───────────

    /// Project the last frame's landmarks into the current frame and match
    /// by descriptor. `last_points[i]` is the landmark seen at the last
    /// frame's keypoint `i`, already resolved against the map.
    ///
    /// Returns the number of associations written into `current`.
    pub fn search_by_projection_from_frame(
        &self,
        current: &mut Frame,
        last: &Frame,
        last_points: &[Option<MapPointView>],
        th: f64,
    ) -> usize {
        let Some(pose_cw) = current.pose_cw().cloned() else {
            return 0;
        };
        let Some(last_pose) = last.pose_cw() else {
            return 0;
        };

        let rcw = pose_cw.rotation_matrix();
        let tcw = pose_cw.translation;
        let twc = -rcw.transpose() * tcw;
        let rlw = last_pose.rotation_matrix();
        let tlw = last_pose.translation;
        // Current camera center expressed in the last camera's frame.
        let tlc = rlw * twc + tlw;

        let baseline = current.camera.baseline();
        let forward = tlc.z > baseline;
        let backward = -tlc.z > baseline;

        let mut rot_hist: Vec<Vec<usize>> = vec![Vec::new(); HISTO_LENGTH];
        let mut nmatches = 0usize;

        for (i, view) in last_points.iter().enumerate() {
            let Some(view) = view else { continue };
            if last.outliers[i] {
                continue;
            }

            let p_cam = rcw * view.position + tcw;
            if p_cam.z <= 0.0 {
                continue;
            }
            let inv_z = 1.0 / p_cam.z;
            let u = current.camera.fx * p_cam.x * inv_z + current.camera.cx;
            let v = current.camera.fy * p_cam.y * inv_z + current.camera.cy;
            if !current.camera.is_in_image(u, v) {
                continue;
            }

            let last_octave = last.keypoints[i].octave.max(0);
            let radius = th * current.pyramid.scale_factors[last_octave as usize];

            let indices = if forward {
                current.features_in_area(u, v, radius, last_octave, -1)
            } else if backward {
                current.features_in_area(u, v, radius, 0, last_octave)
            } else {
                current.features_in_area(u, v, radius, last_octave - 1, last_octave + 1)
            };
            if indices.is_empty() {
                continue;
            }

            let mut best_dist = 256u32;
            let mut best_idx = None;
            for &idx in &indices {
                if current.map_points[idx].is_some() {
                    continue;
                }
                if current.u_right[idx] > 0.0 {
                    let ur = u - current.camera.bf * inv_z;
                    if (ur - current.u_right[idx] as f64).abs() > radius {
                        continue;
                    }
                }
                let dist = view.descriptor.distance(&current.descriptors[idx]);
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx);
                }
            }

            if best_dist <= TH_HIGH {
                if let Some(best_idx) = best_idx {
                    current.map_points[best_idx] = Some(view.id);
                    nmatches += 1;
                    if self.check_orientation {
                        let rot = last.keypoints[i].angle - current.keypoints[best_idx].angle;
                        rot_hist[rotation_bin(rot)].push(best_idx);
                    }
                }
            }
        }

        if self.check_orientation {
            nmatches -= filter_rotation_outliers(&rot_hist, |idx| {
                current.map_points[idx] = None;
            });
        }

        nmatches
    }

    // ── Mode 2: projection of local-map candidates ──────────────────────

    /// Match frustum-tested local-map candidates against the current frame.
    /// `slot_tracked[idx]` marks keypoint slots already carrying a landmark
    /// with observations, which must not be overwritten.
    pub fn search_by_projection_candidates(
        &self,
        current: &mut Frame,
        candidates: &[TrackCandidate],
        th: f64,
        slot_tracked: &[bool],
    ) -> usize {
        let apply_factor = th != 1.0;
        let mut nmatches = 0usize;

        for cand in candidates {
            let level = cand.predicted_level;
            let mut r = radius_by_viewing_cos(cand.view_cos);
            if apply_factor {
                r *= th;
            }
            let radius = r * current.pyramid.scale_factors[level];

            let indices = current.features_in_area(
                cand.proj_x,
                cand.proj_y,
                radius,
                level as i32 - 1,
                level as i32,
            );
            if indices.is_empty() {
                continue;
            }

            let mut best_dist = 256u32;
            let mut best_level = -1i32;
            let mut best_dist2 = 256u32;
            let mut best_level2 = -1i32;
            let mut best_idx = None;

            for &idx in &indices {
                if slot_tracked.get(idx).copied().unwrap_or(false) {
                    continue;
                }
                if current.u_right[idx] > 0.0 {
                    let er = (cand.proj_xr - current.u_right[idx] as f64).abs();
                    if er > radius {
                        continue;
                    }
                }
                let dist = cand.descriptor.distance(&current.descriptors[idx]);
                if dist < best_dist {
                    best_dist2 = best_dist;
                    best_dist = dist;
                    best_level2 = best_level;
                    best_level = current.keypoints[idx].octave;
                    best_idx = Some(idx);
                } else if dist < best_dist2 {
                    best_level2 = current.keypoints[idx].octave;
                    best_dist2 = dist;
                }
            }

            if best_dist <= TH_HIGH {
                // Ratio test, only when both finalists sit on the same level.
                if best_level == best_level2
                    && best_dist as f32 > self.nn_ratio * best_dist2 as f32
                {
                    continue;
                }
                if let Some(best_idx) = best_idx {
                    current.map_points[best_idx] = Some(cand.id);
                    nmatches += 1;
                }
            }
        }

        nmatches
    }

    // ── Mode 3: joint bag-of-words walk ─────────────────────────────────

    /// Match a keyframe's landmarks to the current frame by walking both
    /// feature vectors jointly and comparing only descriptors under the same
    /// vocabulary node. The caller must have cleared the current frame's
    /// associations it wants refilled.
    pub fn search_by_bow(&self, kf: &KeyFrameBowView, current: &mut Frame) -> usize {
        let Some((_, current_fv)) = current.bow.clone() else {
            return 0;
        };

        let kf_nodes: Vec<(&u32, &Vec<usize>)> = kf.feature_vector.iter().collect();
        let cur_nodes: Vec<(&u32, &Vec<usize>)> = current_fv.iter().collect();

        let mut rot_hist: Vec<Vec<usize>> = vec![Vec::new(); HISTO_LENGTH];
        let mut nmatches = 0usize;

        let mut ik = 0usize;
        let mut ic = 0usize;
        while ik < kf_nodes.len() && ic < cur_nodes.len() {
            let (node_kf, indices_kf) = kf_nodes[ik];
            let (node_cur, indices_cur) = cur_nodes[ic];
            if node_kf == node_cur {
                for &idx_kf in indices_kf.iter() {
                    let Some(view) = &kf.map_points[idx_kf] else {
                        continue;
                    };
                    let d_kf = &kf.descriptors[idx_kf];

                    let mut best_dist1 = 256u32;
                    let mut best_dist2 = 256u32;
                    let mut best_idx = None;
                    for &idx_f in indices_cur.iter() {
                        if current.map_points[idx_f].is_some() {
                            continue;
                        }
                        let dist = d_kf.distance(&current.descriptors[idx_f]);
                        if dist < best_dist1 {
                            best_dist2 = best_dist1;
                            best_dist1 = dist;
                            best_idx = Some(idx_f);
                        } else if dist < best_dist2 {
                            best_dist2 = dist;
                        }
                    }

                    if best_dist1 <= TH_LOW
                        && (best_dist1 as f32) < self.nn_ratio * best_dist2 as f32
                    {
                        if let Some(idx_f) = best_idx {
                            current.map_points[idx_f] = Some(view.id);
                            nmatches += 1;
                            if self.check_orientation {
                                let rot =
                                    kf.keypoint_angles[idx_kf] - current.keypoints[idx_f].angle;
                                rot_hist[rotation_bin(rot)].push(idx_f);
                            }
                        }
                    }
                }
                ik += 1;
                ic += 1;
            } else if node_kf < node_cur {
                while ik < kf_nodes.len() && kf_nodes[ik].0 < node_cur {
                    ik += 1;
                }
            } else {
                while ic < cur_nodes.len() && cur_nodes[ic].0 < node_kf {
                    ic += 1;
                }
            }
        }

        if self.check_orientation {
            nmatches -= filter_rotation_outliers(&rot_hist, |idx| {
                current.map_points[idx] = None;
            });
        }

        nmatches
    }

    // ── Mode 4: epipolar search for triangulation ───────────────────────

    /// Find untracked keypoint pairs between two keyframes that satisfy the
    /// epipolar constraint, for the mapper to triangulate.
    pub fn search_for_triangulation(
        &self,
        kf1: &KeyFrameEpipolarView,
        kf2: &KeyFrameEpipolarView,
        f12: &Matrix3<f64>,
        only_stereo: bool,
    ) -> Vec<(usize, usize)> {
        // Epipole: kf1's camera center projected into kf2.
        let c1w = kf1.pose_cw.inverse().translation;
        let c2 = kf2.pose_cw.transform_point(&c1w);
        let (ex, ey) = if c2.z.abs() > 1e-12 {
            let inv_z = 1.0 / c2.z;
            (
                kf2.camera.fx * c2.x * inv_z + kf2.camera.cx,
                kf2.camera.fy * c2.y * inv_z + kf2.camera.cy,
            )
        } else {
            (f64::INFINITY, f64::INFINITY)
        };

        let mut matched2 = vec![false; kf2.keypoints.len()];
        let mut matches12: Vec<i64> = vec![-1; kf1.keypoints.len()];
        let mut rot_hist: Vec<Vec<usize>> = vec![Vec::new(); HISTO_LENGTH];
        let mut nmatches = 0usize;

        let nodes1: Vec<(&u32, &Vec<usize>)> = kf1.feature_vector.iter().collect();
        let nodes2: Vec<(&u32, &Vec<usize>)> = kf2.feature_vector.iter().collect();

        let mut i1 = 0usize;
        let mut i2 = 0usize;
        while i1 < nodes1.len() && i2 < nodes2.len() {
            let (node1, indices1) = nodes1[i1];
            let (node2, indices2) = nodes2[i2];
            if node1 == node2 {
                for &idx1 in indices1.iter() {
                    if kf1.has_map_point[idx1] {
                        continue;
                    }
                    let stereo1 = kf1.u_right[idx1] >= 0.0;
                    if only_stereo && !stereo1 {
                        continue;
                    }
                    let kp1 = &kf1.keypoints[idx1];
                    let d1 = &kf1.descriptors[idx1];

                    let mut best_dist = TH_LOW;
                    let mut best_idx2: i64 = -1;

                    for &idx2 in indices2.iter() {
                        if matched2[idx2] || kf2.has_map_point[idx2] {
                            continue;
                        }
                        let stereo2 = kf2.u_right[idx2] >= 0.0;
                        if only_stereo && !stereo2 {
                            continue;
                        }
                        let dist = d1.distance(&kf2.descriptors[idx2]);
                        if dist > TH_LOW || dist > best_dist {
                            continue;
                        }
                        let kp2 = &kf2.keypoints[idx2];

                        if !stereo1 && !stereo2 {
                            // Monocular pairs near the epipole are useless
                            // for triangulation.
                            let dex = ex - kp2.x as f64;
                            let dey = ey - kp2.y as f64;
                            let limit =
                                100.0 * kf2.pyramid.scale_factors[kp2.octave.max(0) as usize];
                            if dex * dex + dey * dey < limit {
                                continue;
                            }
                        }

                        if check_dist_epipolar_line(kp1, kp2, f12, &kf2.pyramid) {
                            best_idx2 = idx2 as i64;
                            best_dist = dist;
                        }
                    }

                    if best_idx2 >= 0 {
                        let idx2 = best_idx2 as usize;
                        matches12[idx1] = best_idx2;
                        matched2[idx2] = true;
                        nmatches += 1;
                        if self.check_orientation {
                            let rot = kp1.angle - kf2.keypoints[idx2].angle;
                            rot_hist[rotation_bin(rot)].push(idx1);
                        }
                    }
                }
                i1 += 1;
                i2 += 1;
            } else if node1 < node2 {
                while i1 < nodes1.len() && nodes1[i1].0 < node2 {
                    i1 += 1;
                }
            } else {
                while i2 < nodes2.len() && nodes2[i2].0 < node1 {
                    i2 += 1;
                }
            }
        }

        if self.check_orientation {
            filter_rotation_outliers(&rot_hist, |idx1| {
                matches12[idx1] = -1;
            });
        }

        matches12
            .iter()
            .enumerate()
            .filter_map(|(idx1, &idx2)| (idx2 >= 0).then_some((idx1, idx2 as usize)))
            .collect()
    }

    // ── Relocalization projection variant ───────────────────────────────

    /// Project a keyframe's landmarks into a posed frame, skipping the ones
    /// in `already_found`, with a caller-chosen descriptor distance bound. Used to
    /// densify matches around a relocalization hypothesis.
    pub fn search_by_projection_from_keyframe(
        &self,
        current: &mut Frame,
        kf_points: &[Option<MapPointView>],
        kf_angles: &[f32],
        already_found: &HashSet<MapPointId>,
        th: f64,
        orb_dist: u32,
        scale_data: &[(f64, f64)],
    ) -> usize {
        let Some(pose_cw) = current.pose_cw().cloned() else {
            return 0;
        };
        let rcw = pose_cw.rotation_matrix();
        let tcw = pose_cw.translation;
        let ow = -rcw.transpose() * tcw;

        let mut rot_hist: Vec<Vec<usize>> = vec![Vec::new(); HISTO_LENGTH];
        let mut nmatches = 0usize;

        for (i, view) in kf_points.iter().enumerate() {
            let Some(view) = view else { continue };
            if already_found.contains(&view.id) {
                continue;
            }

            let p_cam = rcw * view.position + tcw;
            let Some(uv) = current.camera.project(&p_cam) else {
                continue;
            };
            if !current.camera.is_in_image(uv.x, uv.y) {
                continue;
            }

            let dist3d = (view.position - ow).norm();
            let (min_distance, max_distance) = scale_data[i];
            if dist3d < min_distance || dist3d > max_distance {
                continue;
            }
            let level = current.pyramid.predict_scale(dist3d, max_distance);

            let radius = th * current.pyramid.scale_factors[level];
            let indices = current.features_in_area(
                uv.x,
                uv.y,
                radius,
                level as i32 - 1,
                level as i32 + 1,
            );
            if indices.is_empty() {
                continue;
            }

            let mut best_dist = 256u32;
            let mut best_idx = None;
            for &idx in &indices {
                if current.map_points[idx].is_some() {
                    continue;
                }
                let dist = view.descriptor.distance(&current.descriptors[idx]);
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx);
                }
            }

            if best_dist <= orb_dist {
                if let Some(idx) = best_idx {
                    current.map_points[idx] = Some(view.id);
                    nmatches += 1;
                    if self.check_orientation {
                        let rot = kf_angles[i] - current.keypoints[idx].angle;
                        rot_hist[rotation_bin(rot)].push(idx);
                    }
                }
            }
        }

        if self.check_orientation {
            nmatches -= filter_rotation_outliers(&rot_hist, |idx| {
                current.map_points[idx] = None;
            });
        }

        nmatches
    }

    // ── Fuse ────────────────────────────────────────────────────────────

    /// Project landmarks into a keyframe; merge with the resident landmark
    /// (more observations wins) or attach a new observation. Runs under the
    /// map write lock on the mapper side.
    pub fn fuse(
        &self,
        map: &mut Map,
        kf_id: KeyFrameId,
        candidates: &[MapPointId],
        th: f64,
    ) -> usize {
        let mut nfused = 0usize;

        for &mp_id in candidates {
            let Some(kf) = map.get_keyframe(kf_id) else {
                return nfused;
            };
            let rcw = kf.pose_cw.rotation_matrix();
            let tcw = kf.pose_cw.translation;
            let ow = kf.camera_center();
            let camera = kf.camera;
            let pyramid = Arc::clone(&kf.pyramid);

            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            if mp.is_observed_by(kf_id) {
                continue;
            }

            let p_cam = rcw * mp.position + tcw;
            if p_cam.z < 0.0 {
                continue;
            }
            let Some(uv) = camera.project(&p_cam) else {
                continue;
            };
            if !camera.is_in_image(uv.x, uv.y) {
                continue;
            }
            let ur = uv.x - camera.bf / p_cam.z;

            let po = mp.position - ow;
            let dist3d = po.norm();
            if !mp.is_in_distance_range(dist3d) {
                continue;
            }
            // Viewing angle must be under 60 degrees.
            if po.dot(&mp.normal) < 0.5 * dist3d {
                continue;
            }

            let level = mp.predict_scale(dist3d, &pyramid);
            let radius = th * pyramid.scale_factors[level];
            let descriptor = mp.descriptor;
            let mp_obs = mp.num_observations();

            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            let indices = kf.features_in_area(uv.x, uv.y, radius);
            if indices.is_empty() {
                continue;
            }

            let mut best_dist = 256u32;
            let mut best_idx = None;
            for &idx in &indices {
                let kp = &kf.keypoints[idx];
                let kp_level = kp.octave;
                if kp_level < level as i32 - 1 || kp_level > level as i32 {
                    continue;
                }

                let inv_sigma2 = pyramid.inv_level_sigma2[kp_level.max(0) as usize];
                if kf.u_right[idx] >= 0.0 {
                    let ex = uv.x - kp.x as f64;
                    let ey = uv.y - kp.y as f64;
                    let er = ur - kf.u_right[idx] as f64;
                    if (ex * ex + ey * ey + er * er) * inv_sigma2 > 7.8 {
                        continue;
                    }
                } else {
                    let ex = uv.x - kp.x as f64;
                    let ey = uv.y - kp.y as f64;
                    if (ex * ex + ey * ey) * inv_sigma2 > 5.99 {
                        continue;
                    }
                }

                let dist = descriptor.distance(&kf.descriptors[idx]);
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = Some(idx);
                }
            }

            let Some(idx) = best_idx else {
                continue;
            };
            if best_dist <= TH_LOW {
                let resident = map.get_keyframe(kf_id).and_then(|kf| kf.get_map_point(idx));
                match resident {
                    Some(resident_id) => {
                        let resident_obs = map
                            .get_map_point(resident_id)
                            .map(|r| r.num_observations())
                            .unwrap_or(0);
                        if resident_obs > mp_obs {
                            map.replace_map_point(mp_id, resident_id);
                        } else {
                            map.replace_map_point(resident_id, mp_id);
                        }
                    }
                    None => {
                        map.add_observation(mp_id, kf_id, idx);
                        map.refresh_point_descriptor(mp_id);
                    }
                }
                nfused += 1;
            }
        }

        nfused
    }

    // ── Line and plane association ──────────────────────────────────────

    /// Associate local-map lines with the current frame's detected segments
    /// by projected proximity, direction and descriptor distance.
    pub fn search_lines_by_projection(
        &self,
        current: &mut Frame,
        candidates: &[LineCandidate],
        th: f64,
    ) -> usize {
        let mut nmatches = 0usize;

        for cand in candidates {
            let mid = (cand.start_proj + cand.end_proj) * 0.5;
            let dir = cand.end_proj - cand.start_proj;
            let cand_angle = dir.y.atan2(dir.x).to_degrees().rem_euclid(180.0);

            let mut best_dist = 256u32;
            let mut best_dist2 = 256u32;
            let mut best_idx = None;

            for (idx, line) in current.lines.iter().enumerate() {
                if current.map_lines[idx].is_some() {
                    continue;
                }
                let obs_mid_x = (line.start_x + line.end_x) as f64 * 0.5;
                let obs_mid_y = (line.start_y + line.end_y) as f64 * 0.5;
                let dx = obs_mid_x - mid.x;
                let dy = obs_mid_y - mid.y;
                if dx.abs() > th || dy.abs() > th {
                    continue;
                }
                let mut da = (line.angle_deg() as f64 - cand_angle).abs();
                if da > 90.0 {
                    da = 180.0 - da;
                }
                if da > 10.0 {
                    continue;
                }
                let dist = cand.descriptor.distance(&line.descriptor);
                if dist < best_dist {
                    best_dist2 = best_dist;
                    best_dist = dist;
                    best_idx = Some(idx);
                } else if dist < best_dist2 {
                    best_dist2 = dist;
                }
            }

            if best_dist <= TH_HIGH && (best_dist as f32) < self.nn_ratio * best_dist2 as f32 {
                if let Some(best_idx) = best_idx {
                    current.map_lines[best_idx] = Some(cand.id);
                    nmatches += 1;
                }
            }
        }

        nmatches
    }

    /// Associate map planes with the frame's segmented planes by normal
    /// angle and plane offset in the camera frame.
    ///
    /// `ver_th` is the maximum normal angle in radians, `dis_th` the maximum
    /// offset difference in meters.
    pub fn match_planes(
        &self,
        current: &mut Frame,
        candidates: &[PlaneCandidate],
        pose_cw: &SE3,
        ver_th: f64,
        dis_th: f64,
    ) -> usize {
        let cos_th = ver_th.cos();
        let mut nmatches = 0usize;

        for (idx, obs) in current.planes.iter().enumerate() {
            if current.map_planes[idx].is_some() {
                continue;
            }
            let n_obs = obs.normal();
            let d_obs = obs.coeffs.w;

            let mut best_offset = dis_th;
            let mut best_id = None;
            for cand in candidates {
                let (n_pred, d_pred) = transform_plane(&cand.coeffs_world, pose_cw);
                let mut dot = n_obs.dot(&n_pred);
                let mut d_pred = d_pred;
                // (n, d) and (-n, -d) describe the same plane.
                if dot < 0.0 {
                    dot = -dot;
                    d_pred = -d_pred;
                }
                if dot < cos_th {
                    continue;
                }
                let offset = (d_obs - d_pred).abs();
                if offset < best_offset {
                    best_offset = offset;
                    best_id = Some(cand.id);
                }
            }

            if let Some(id) = best_id {
                current.map_planes[idx] = Some(id);
                nmatches += 1;
            }
        }

        nmatches
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(0.6, true)
    }
}

/// Transform world-frame plane coefficients into the camera frame.
///
/// For `p_cam = R p_world + t`: `n_cam = R n`, `d_cam = d - n_cam . t`.
pub fn transform_plane(coeffs_world: &Vector4<f64>, pose_cw: &SE3) -> (Vector3<f64>, f64) {
    let n_world = coeffs_world.xyz();
    let n_cam = pose_cw.rotation * n_world;
    let d_cam = coeffs_world.w - n_cam.dot(&pose_cw.translation);
    (n_cam, d_cam)
}

/// Inverse of [`transform_plane`]: lift camera-frame plane coefficients
/// into the world frame given the camera-to-world transform `T_wc`.
pub fn transform_plane_to_world(coeffs_cam: &Vector4<f64>, pose_wc: &SE3) -> Vector4<f64> {
    let n_cam = coeffs_cam.xyz();
    let n_world = pose_wc.rotation * n_cam;
    // d_w = d_c - n_w . t_wc, since n_c . p_c + d_c = n_w . p_w + d_w.
    let d_world = coeffs_cam.w - n_world.dot(&pose_wc.translation);
    Vector4::new(n_world.x, n_world.y, n_world.z, d_world)
}

/// Squared distance of `kp2` to the epipolar line of `kp1`, gated by the
/// 95% chi-square threshold at kp2's detection scale.
fn check_dist_epipolar_line(
    kp1: &KeyPoint,
    kp2: &KeyPoint,
    f12: &Matrix3<f64>,
    pyramid2: &ScalePyramid,
) -> bool {
    let x1 = Vector3::new(kp1.x as f64, kp1.y as f64, 1.0);
    let line = f12.transpose() * x1;
    let num = line.x * kp2.x as f64 + line.y * kp2.y as f64 + line.z;
    let den = line.x * line.x + line.y * line.y;
    if den == 0.0 {
        return false;
    }
    let dsqr = num * num / den;
    dsqr < 3.84 * pyramid2.level_sigma2[kp2.octave.max(0) as usize]
}

/// Histogram bin for a rotation delta in degrees. Bins are inclusive-low,
/// exclusive-high over [0, 360), wrapping on the upper boundary.
fn rotation_bin(rot: f32) -> usize {
    let mut rot = rot;
    if rot < 0.0 {
        rot += 360.0;
    }
    let bin = (rot as f64 * HISTO_LENGTH as f64 / 360.0).floor() as i64;
    (bin.rem_euclid(HISTO_LENGTH as i64)) as usize
}

/// Indices of the three fullest histogram bins. Secondary maxima under 10%
/// of the best bin are discarded.
fn compute_three_maxima(hist: &[Vec<usize>]) -> [i64; 3] {
    let mut max1 = 0usize;
    let mut max2 = 0usize;
    let mut max3 = 0usize;
    let mut ind: [i64; 3] = [-1, -1, -1];

    for (i, bin) in hist.iter().enumerate() {
        let s = bin.len();
        if s > max1 {
            max3 = max2;
            max2 = max1;
            max1 = s;
            ind[2] = ind[1];
            ind[1] = ind[0];
            ind[0] = i as i64;
        } else if s > max2 {
            max3 = max2;
            max2 = s;
            ind[2] = ind[1];
            ind[1] = i as i64;
        } else if s > max3 {
            max3 = s;
            ind[2] = i as i64;
        }
    }

    if (max2 as f64) < 0.1 * max1 as f64 {
        ind[1] = -1;
        ind[2] = -1;
    } else if (max3 as f64) < 0.1 * max1 as f64 {
        ind[2] = -1;
    }
    ind
}

/// Drop every match outside the three dominant rotation bins. Calls
/// `unassign` for each dropped entry and returns how many were dropped.
fn filter_rotation_outliers(hist: &[Vec<usize>], mut unassign: impl FnMut(usize)) -> usize {
    let keep = compute_three_maxima(hist);
    let mut dropped = 0usize;
    for (i, bin) in hist.iter().enumerate() {
        let i = i as i64;
        if i == keep[0] || i == keep[1] || i == keep[2] {
            continue;
        }
        for &entry in bin {
            unassign(entry);
            dropped += 1;
        }
    }
    dropped
}
