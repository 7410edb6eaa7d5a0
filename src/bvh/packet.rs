use glam::Vec3;

use super::{Bvh, BvhNode};
use crate::ray::{Intersection, Ray};

/// The four bounding planes of a ray bundle, normals pointing outwards,
/// with the per-plane AABB corner selection baked in.
struct Frustum {
    normal: [Vec3; 4],
    dist: [f32; 4],
    /// Per plane and axis: take the box max instead of the min when the
    /// normal component is negative (the corner deepest inside).
    take_max: [[bool; 3]; 4],
}

impl Frustum {
    fn new(origin: Vec3, corners: [Vec3; 4]) -> Self {
        let [p0, p1, p2, p3] = corners;
        let normal = [
            (p0 - origin).cross(p0 - p2).normalize(), // left
            (p3 - origin).cross(p3 - p1).normalize(), // right
            (p1 - origin).cross(p1 - p0).normalize(), // top
            (p2 - origin).cross(p2 - p3).normalize(), // bottom
        ];
        let dist = [
            origin.dot(normal[0]),
            origin.dot(normal[1]),
            origin.dot(normal[2]),
            origin.dot(normal[3]),
        ];
        let take_max =
            normal.map(|n| [n.x < 0.0, n.y < 0.0, n.z < 0.0]);
        Frustum { normal, dist, take_max }
    }

    /// True when the box lies entirely outside one of the planes.
    fn culls(&self, aabb_min: Vec3, aabb_max: Vec3) -> bool {
        for p in 0..4 {
            let corner = Vec3::new(
                if self.take_max[p][0] { aabb_max.x } else { aabb_min.x },
                if self.take_max[p][1] { aabb_max.y } else { aabb_min.y },
                if self.take_max[p][2] { aabb_max.z } else { aabb_min.z },
            );
            if corner.dot(self.normal[p]) > self.dist[p] {
                return true;
            }
        }
        false
    }
}

#[inline]
fn slab(ray: &Ray, o1: Vec3, o2: Vec3) -> (f32, f32) {
    let t1 = o1 * ray.inv_direction;
    let t2 = o2 * ray.inv_direction;
    (t1.min(t2).max_element(), t1.max(t2).min_element())
}

/// Outcome of testing one child node against the active ray interval.
enum Visit {
    Skip,
    Enter { dist: f32, first: usize, last: usize },
}

fn test_child(
    node: &BvhNode,
    packet: &[Ray; 256],
    origin: Vec3,
    frustum: &Frustum,
    first: usize,
    last: usize,
) -> Visit {
    let o1 = node.aabb_min - origin;
    let o2 = node.aabb_max - origin;
    // 1. early in: the packet's first active ray hits the node
    let (tmin, tmax) = slab(&packet[first], o1, o2);
    if tmax >= tmin && tmin < packet[first].hit.t && tmax >= 0.0 {
        return Visit::Enter { dist: tmin, first, last };
    }
    // 2. early out: the node is beyond one of the frustum planes
    if frustum.culls(node.aabb_min, node.aabb_max) {
        return Visit::Skip;
    }
    // 3. narrow the interval ray by ray from both ends
    let mut dist = tmin;
    let mut first = first;
    let mut last = last;
    while first <= last {
        let (tmin, tmax) = slab(&packet[first], o1, o2);
        if tmax >= tmin && tmin < packet[first].hit.t && tmax >= 0.0 {
            dist = tmin;
            break;
        }
        first += 1;
    }
    while last > first {
        let (tmin, tmax) = slab(&packet[last], o1, o2);
        if tmax >= tmin && tmin < packet[last].hit.t && tmax >= 0.0 {
            break;
        }
        last -= 1;
    }
    if first > last {
        Visit::Skip
    } else {
        Visit::Enter { dist, first, last }
    }
}

impl Bvh<'_> {
    /// Traverse the canonical tree with a coherent bundle of 256 rays
    /// sharing one origin. Rays 0, 51 and 204, 255 must be the bundle's
    /// corner rays; their directions span the bounding frustum used to cull
    /// whole subtrees. Each ray's closest hit lands in its own record, as
    /// if traversed alone.
    pub fn intersect_packet(&self, packet: &mut [Ray; 256]) {
        debug_assert!(!self.nodes.is_empty());
        let origin = packet[0].origin;
        let corners = [
            origin + packet[0].direction,
            origin + packet[51].direction,
            origin + packet[204].direction,
            origin + packet[255].direction,
        ];
        let frustum = Frustum::new(origin, corners);

        let mut node_idx = 0u32;
        let mut first = 0usize;
        let mut last = 255usize;
        let mut stack = [(0u32, 0u32); 64];
        let mut sp = 0usize;
        loop {
            let node = self.nodes[node_idx as usize];
            if node.is_leaf() {
                for j in 0..node.tri_count {
                    let prim = self.tri_idx[(node.left_first + j) as usize];
                    let vid = prim as usize * 3;
                    let v0 = self.verts[vid].truncate();
                    let edge1 = self.verts[vid + 1].truncate() - v0;
                    let edge2 = self.verts[vid + 2].truncate() - v0;
                    let s = origin - v0;
                    for ray in packet[first..=last].iter_mut() {
                        let h = ray.direction.cross(edge2);
                        let a = edge1.dot(h);
                        if a.abs() < 1e-7 {
                            continue;
                        }
                        let f = 1.0 / a;
                        let u = f * s.dot(h);
                        if !(0.0..=1.0).contains(&u) {
                            continue;
                        }
                        let q = s.cross(edge1);
                        let v = f * ray.direction.dot(q);
                        if v < 0.0 || u + v > 1.0 {
                            continue;
                        }
                        let t = f * edge2.dot(q);
                        if t > 0.0 && t < ray.hit.t {
                            ray.hit = Intersection { t, u, v, prim };
                        }
                    }
                }
                if sp == 0 {
                    break;
                }
                sp -= 1;
                let (range, idx) = stack[sp];
                node_idx = idx;
                first = (range >> 8) as usize;
                last = (range & 255) as usize;
                continue;
            }

            let left = self.nodes[node.left_first as usize];
            let right = self.nodes[node.left_first as usize + 1];
            let visit_left = test_child(&left, packet, origin, &frustum, first, last);
            let visit_right = test_child(&right, packet, origin, &frustum, first, last);
            match (visit_left, visit_right) {
                (
                    Visit::Enter { dist: dl, first: lf, last: ll },
                    Visit::Enter { dist: dr, first: rf, last: rl },
                ) => {
                    // both hit: descend into the nearer child first
                    if dl < dr {
                        debug_assert!(sp < stack.len());
                        stack[sp] = (((rf << 8) | rl) as u32, node.left_first + 1);
                        sp += 1;
                        node_idx = node.left_first;
                        first = lf;
                        last = ll;
                    } else {
                        debug_assert!(sp < stack.len());
                        stack[sp] = (((lf << 8) | ll) as u32, node.left_first);
                        sp += 1;
                        node_idx = node.left_first + 1;
                        first = rf;
                        last = rl;
                    }
                }
                (Visit::Enter { first: lf, last: ll, .. }, Visit::Skip) => {
                    node_idx = node.left_first;
                    first = lf;
                    last = ll;
                }
                (Visit::Skip, Visit::Enter { first: rf, last: rl, .. }) => {
                    node_idx = node.left_first + 1;
                    first = rf;
                    last = rl;
                }
                (Visit::Skip, Visit::Skip) => {
                    if sp == 0 {
                        break;
                    }
                    sp -= 1;
                    let (range, idx) = stack[sp];
                    node_idx = idx;
                    first = (range >> 8) as usize;
                    last = (range & 255) as usize;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use crate::Layout;
    use glam::Vec4;

    /// 16x16 bundle in 4x4-tile order, so indices 0, 51, 204 and 255 are
    /// the geometric corners the frustum is built from.
    fn bundle(origin: Vec3, span: f32, dist: f32) -> Box<[Ray; 256]> {
        let mut rays = Vec::with_capacity(256);
        for tile in 0..16 {
            let (tx, ty) = (tile % 4, tile / 4);
            for i in 0..16 {
                let (ix, iy) = (i % 4, i / 4);
                let x = (tx * 4 + ix) as f32 / 15.0; // 0..1
                let y = (ty * 4 + iy) as f32 / 15.0;
                let target = origin
                    + Vec3::new((x - 0.5) * span, (y - 0.5) * span, dist);
                rays.push(Ray::new(origin, target - origin));
            }
        }
        let rays: Box<[Ray; 256]> = rays.into_boxed_slice().try_into().ok().unwrap();
        rays
    }

    #[test]
    fn corner_indices_are_the_bundle_corners() {
        let rays = bundle(Vec3::ZERO, 2.0, 4.0);
        let dirs: Vec<Vec3> = rays.iter().map(|r| r.direction).collect();
        // ray 0 is the (0,0) corner, 51 is (15,0), 204 is (0,15), 255 is (15,15)
        assert_eq!(dirs[0], Ray::new(Vec3::ZERO, Vec3::new(-1.0, -1.0, 4.0)).direction);
        assert_eq!(dirs[51], Ray::new(Vec3::ZERO, Vec3::new(1.0, -1.0, 4.0)).direction);
        assert_eq!(dirs[204], Ray::new(Vec3::ZERO, Vec3::new(-1.0, 1.0, 4.0)).direction);
        assert_eq!(dirs[255], Ray::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 4.0)).direction);
    }

    #[test]
    fn packet_matches_single_ray_traversal_on_a_soup() {
        let verts = triangle_soup(300, 4.0, 0.8, 7);
        let mut bvh = Bvh::new();
        bvh.build(&verts, 300);

        let origin = Vec3::new(0.0, 0.0, -12.0);
        let mut packet = bundle(origin, 10.0, 16.0);
        let singles: Vec<Ray> = packet.to_vec();
        bvh.intersect_packet(&mut packet);

        let mut hits = 0;
        for (i, mut single) in singles.into_iter().enumerate() {
            bvh.intersect(&mut single, Layout::Wald32);
            let packed = &packet[i];
            assert_eq!(single.hit.is_hit(), packed.hit.is_hit(), "ray {i}");
            if single.hit.is_hit() {
                hits += 1;
                assert_eq!(single.hit.prim, packed.hit.prim, "ray {i}");
                assert!(
                    (single.hit.t - packed.hit.t).abs() <= 1e-4 * single.hit.t,
                    "ray {i}: {} vs {}",
                    single.hit.t,
                    packed.hit.t
                );
            }
        }
        println!("{hits}/256 packet rays hit");
        assert!(hits > 0, "test scene should be in front of the bundle");
    }

    #[test]
    fn packet_against_a_single_triangle() {
        let verts = vec![
            Vec4::new(-5.0, -5.0, 3.0, 0.0),
            Vec4::new(5.0, -5.0, 3.0, 0.0),
            Vec4::new(0.0, 5.0, 3.0, 0.0),
        ];
        let mut bvh = Bvh::new();
        bvh.build(&verts, 1);
        let mut packet = bundle(Vec3::ZERO, 4.0, 3.0);
        bvh.intersect_packet(&mut packet);
        let center_hits = packet.iter().filter(|r| r.hit.is_hit()).count();
        assert!(center_hits > 0);
        for ray in packet.iter() {
            if ray.hit.is_hit() {
                assert_eq!(ray.hit.prim, 0);
            }
        }
    }
}
