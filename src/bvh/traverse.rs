use glam::{Vec3, Vec4};
use wide::f32x4;

use super::layout::WideNode;
use super::{Bvh, Layout};
use crate::ray::{Ray, MISS};

/// Slab test. Returns the entry distance, or `MISS` when the box is missed,
/// lies behind the ray, or is farther than the current hit.
#[inline]
pub(crate) fn intersect_aabb(ray: &Ray, aabb_min: Vec3, aabb_max: Vec3) -> f32 {
    let t1 = (aabb_min - ray.origin) * ray.inv_direction;
    let t2 = (aabb_max - ray.origin) * ray.inv_direction;
    let tmin = t1.min(t2).max_element();
    let tmax = t1.max(t2).min_element();
    if tmax >= tmin && tmin < ray.hit.t && tmax >= 0.0 {
        tmin
    } else {
        MISS
    }
}

/// Möller–Trumbore, no backface culling. Shortens the ray on a hit.
#[inline]
pub(crate) fn intersect_tri(ray: &mut Ray, verts: &[Vec4], prim: u32) {
    let vid = prim as usize * 3;
    let v0 = verts[vid].truncate();
    let edge1 = verts[vid + 1].truncate() - v0;
    let edge2 = verts[vid + 2].truncate() - v0;
    let h = ray.direction.cross(edge2);
    let a = edge1.dot(h);
    if a.abs() < 1e-7 {
        return; // ray parallel to triangle
    }
    let f = 1.0 / a;
    let s = ray.origin - v0;
    let u = f * s.dot(h);
    if !(0.0..=1.0).contains(&u) {
        return;
    }
    let q = s.cross(edge1);
    let v = f * ray.direction.dot(q);
    if v < 0.0 || u + v > 1.0 {
        return;
    }
    let t = f * edge2.dot(q);
    if t > 0.0 && t < ray.hit.t {
        ray.hit = crate::ray::Intersection { t, u, v, prim };
    }
}

impl Bvh<'_> {
    /// Closest-hit traversal in the given layout, which must have been
    /// produced by a prior build or conversion. The result lands in
    /// `ray.hit`; the return value counts visited nodes, which makes a
    /// useful traversal heatmap.
    pub fn intersect(&self, ray: &mut Ray, layout: Layout) -> u32 {
        match layout {
            Layout::Wald32 => self.intersect_wald(ray),
            Layout::Alt => self.intersect_alt(ray),
            Layout::AltSoa => self.intersect_soa(ray),
            Layout::Wide4 => intersect_wide(&self.wide4, self, ray),
            Layout::Wide8 => intersect_wide(&self.wide8, self, ray),
            _ => panic!("layout {layout:?} has no CPU traversal kernel"),
        }
    }

    fn intersect_wald(&self, ray: &mut Ray) -> u32 {
        debug_assert!(!self.nodes.is_empty());
        let mut node_idx = 0u32;
        let mut stack = [0u32; 64];
        let mut sp = 0usize;
        let mut steps = 0u32;
        loop {
            steps += 1;
            let node = self.nodes[node_idx as usize];
            if node.is_leaf() {
                for i in 0..node.tri_count {
                    intersect_tri(
                        ray,
                        self.verts,
                        self.tri_idx[(node.left_first + i) as usize],
                    );
                }
                if sp == 0 {
                    break;
                }
                sp -= 1;
                node_idx = stack[sp];
                continue;
            }
            let mut near = node.left_first;
            let mut far = node.left_first + 1;
            let child1 = self.nodes[near as usize];
            let child2 = self.nodes[far as usize];
            let mut dist1 = intersect_aabb(ray, child1.aabb_min, child1.aabb_max);
            let mut dist2 = intersect_aabb(ray, child2.aabb_min, child2.aabb_max);
            if dist1 > dist2 {
                std::mem::swap(&mut dist1, &mut dist2);
                std::mem::swap(&mut near, &mut far);
            }
            if dist1 == MISS {
                if sp == 0 {
                    break;
                }
                sp -= 1;
                node_idx = stack[sp];
            } else {
                node_idx = near;
                if dist2 != MISS {
                    stack[sp] = far;
                    sp += 1;
                }
            }
        }
        steps
    }

    /// Same control flow as the canonical kernel, but the child bounds come
    /// straight out of the parent node.
    fn intersect_alt(&self, ray: &mut Ray) -> u32 {
        debug_assert!(!self.alt_nodes.is_empty());
        let mut node_idx = 0u32;
        let mut stack = [0u32; 64];
        let mut sp = 0usize;
        let mut steps = 0u32;
        loop {
            steps += 1;
            let node = self.alt_nodes[node_idx as usize];
            if node.is_leaf() {
                for i in 0..node.tri_count {
                    intersect_tri(
                        ray,
                        self.verts,
                        self.tri_idx[(node.first_tri + i) as usize],
                    );
                }
                if sp == 0 {
                    break;
                }
                sp -= 1;
                node_idx = stack[sp];
                continue;
            }
            let mut dist1 = intersect_aabb(ray, node.lmin, node.lmax);
            let mut dist2 = intersect_aabb(ray, node.rmin, node.rmax);
            let mut near = node.left;
            let mut far = node.right;
            if dist1 > dist2 {
                std::mem::swap(&mut dist1, &mut dist2);
                std::mem::swap(&mut near, &mut far);
            }
            if dist1 == MISS {
                if sp == 0 {
                    break;
                }
                sp -= 1;
                node_idx = stack[sp];
            } else {
                node_idx = near;
                if dist2 != MISS {
                    stack[sp] = far;
                    sp += 1;
                }
            }
        }
        steps
    }

    /// Both children's slab tests in one four-lane pass over the SoA node.
    fn intersect_soa(&self, ray: &mut Ray) -> u32 {
        debug_assert!(!self.soa_nodes.is_empty());
        let ox = f32x4::splat(ray.origin.x);
        let oy = f32x4::splat(ray.origin.y);
        let oz = f32x4::splat(ray.origin.z);
        let rdx = f32x4::splat(ray.inv_direction.x);
        let rdy = f32x4::splat(ray.inv_direction.y);
        let rdz = f32x4::splat(ray.inv_direction.z);
        let mut node_idx = 0u32;
        let mut stack = [0u32; 64];
        let mut sp = 0usize;
        let mut steps = 0u32;
        loop {
            steps += 1;
            let node = self.soa_nodes[node_idx as usize];
            if node.is_leaf() {
                for i in 0..node.tri_count {
                    intersect_tri(
                        ray,
                        self.verts,
                        self.tri_idx[(node.first_tri + i) as usize],
                    );
                }
                if sp == 0 {
                    break;
                }
                sp -= 1;
                node_idx = stack[sp];
                continue;
            }
            // lanes: [left lo, left hi, right lo, right hi] per axis
            let x = ((node.xxxx - ox) * rdx).to_array();
            let y = ((node.yyyy - oy) * rdy).to_array();
            let z = ((node.zzzz - oz) * rdz).to_array();
            let tmin_l = x[0].min(x[1]).max(y[0].min(y[1])).max(z[0].min(z[1])).max(0.0);
            let tmax_l = x[0].max(x[1]).min(y[0].max(y[1])).min(z[0].max(z[1])).min(ray.hit.t);
            let tmin_r = x[2].min(x[3]).max(y[2].min(y[3])).max(z[2].min(z[3])).max(0.0);
            let tmax_r = x[2].max(x[3]).min(y[2].max(y[3])).min(z[2].max(z[3])).min(ray.hit.t);
            let mut dist1 = if tmax_l >= tmin_l { tmin_l } else { MISS };
            let mut dist2 = if tmax_r >= tmin_r { tmin_r } else { MISS };
            let mut near = node.left;
            let mut far = node.right;
            if dist1 > dist2 {
                std::mem::swap(&mut dist1, &mut dist2);
                std::mem::swap(&mut near, &mut far);
            }
            if dist1 == MISS {
                if sp == 0 {
                    break;
                }
                sp -= 1;
                node_idx = stack[sp];
            } else {
                node_idx = near;
                if dist2 != MISS {
                    stack[sp] = far;
                    sp += 1;
                }
            }
        }
        steps
    }
}

/// Reference traversal of a collapsed wide tree: test every active child,
/// push all hits, pop. Correctness-first, no ordering.
fn intersect_wide<const N: usize>(nodes: &[WideNode<N>], bvh: &Bvh, ray: &mut Ray) -> u32 {
    debug_assert!(!nodes.is_empty());
    let mut node_idx = 0u32;
    let mut stack = [0u32; 128];
    let mut sp = 0usize;
    let mut steps = 0u32;
    loop {
        steps += 1;
        let node = &nodes[node_idx as usize];
        if node.is_leaf() {
            for i in 0..node.tri_count {
                intersect_tri(ray, bvh.verts, bvh.tri_idx[(node.first_tri + i) as usize]);
            }
        } else {
            for i in 0..node.child_count as usize {
                let child = &nodes[node.child[i] as usize];
                if intersect_aabb(ray, child.aabb_min, child.aabb_max) < MISS {
                    debug_assert!(sp < stack.len());
                    stack[sp] = node.child[i];
                    sp += 1;
                }
            }
        }
        if sp == 0 {
            break;
        }
        sp -= 1;
        node_idx = stack[sp];
    }
    steps
}
