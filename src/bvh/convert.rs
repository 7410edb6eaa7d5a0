use glam::{Vec3, Vec4};
use wide::f32x4;

use super::layout::{gpu4_leaf_info, AltNode, SoaNode, VerboseNode, WideNode, NO_PARENT};
use super::{Bvh, BvhNode, Layout};

impl Bvh<'_> {
    /// Transform the tree between node layouts. Valid edges are `Wald32 →
    /// {Alt, AltSoa, Verbose, Wide4, Wide8}`, `Wide4 → Gpu4` and `Verbose →
    /// Wald32`; anything else panics. The source pool is kept. After any
    /// conversion the instance can no longer be rebuilt in place.
    pub fn convert(&mut self, from: Layout, to: Layout) {
        match (from, to) {
            (Layout::Wald32, Layout::Alt) => self.wald_to_alt(),
            (Layout::Wald32, Layout::AltSoa) => self.wald_to_soa(),
            (Layout::Wald32, Layout::Verbose) => self.wald_to_verbose(),
            (Layout::Wald32, Layout::Wide4) => {
                let mut out = std::mem::take(&mut self.wide4);
                collapse_wide(&self.nodes, &mut out);
                self.wide4 = out;
            }
            (Layout::Wald32, Layout::Wide8) => {
                let mut out = std::mem::take(&mut self.wide8);
                collapse_wide(&self.nodes, &mut out);
                self.wide8 = out;
            }
            (Layout::Wide4, Layout::Gpu4) => self.wide4_to_gpu4(),
            (Layout::Verbose, Layout::Wald32) => self.verbose_to_wald(),
            _ => panic!("unsupported layout conversion {from:?} -> {to:?}"),
        }
        self.rebuildable = false;
    }

    /// Pre-order walk; each interior node learns its left child's new index
    /// immediately and has its right patched once the left subtree is done.
    fn wald_to_alt(&mut self) {
        assert!(!self.nodes.is_empty(), "no tree to convert");
        self.alt_nodes.clear();
        self.alt_nodes.resize(self.nodes.len(), AltNode::default());
        let mut emitted = 0u32;
        let mut node_idx = 0usize;
        let mut stack = [(0u32, 0u32); 64];
        let mut sp = 0usize;
        loop {
            let node = self.nodes[node_idx];
            let idx = emitted as usize;
            emitted += 1;
            if node.is_leaf() {
                self.alt_nodes[idx].tri_count = node.tri_count;
                self.alt_nodes[idx].first_tri = node.left_first;
                if sp == 0 {
                    break;
                }
                sp -= 1;
                let (parent, right_old) = stack[sp];
                node_idx = right_old as usize;
                self.alt_nodes[parent as usize].right = emitted;
            } else {
                let left = self.nodes[node.left_first as usize];
                let right = self.nodes[node.left_first as usize + 1];
                self.alt_nodes[idx] = AltNode {
                    lmin: left.aabb_min,
                    left: emitted,
                    lmax: left.aabb_max,
                    right: 0, // patched when the left subtree is complete
                    rmin: right.aabb_min,
                    tri_count: 0,
                    rmax: right.aabb_max,
                    first_tri: 0,
                };
                stack[sp] = (idx as u32, node.left_first + 1);
                sp += 1;
                node_idx = node.left_first as usize;
            }
        }
        self.alt_nodes.truncate(emitted as usize);
    }

    /// Same walk as [`Self::wald_to_alt`], packing the child bounds into
    /// `[lmin, lmax, rmin, rmax]` lanes per axis.
    fn wald_to_soa(&mut self) {
        assert!(!self.nodes.is_empty(), "no tree to convert");
        self.soa_nodes.clear();
        self.soa_nodes.resize(self.nodes.len(), SoaNode::default());
        let mut emitted = 0u32;
        let mut node_idx = 0usize;
        let mut stack = [(0u32, 0u32); 64];
        let mut sp = 0usize;
        loop {
            let node = self.nodes[node_idx];
            let idx = emitted as usize;
            emitted += 1;
            if node.is_leaf() {
                self.soa_nodes[idx].tri_count = node.tri_count;
                self.soa_nodes[idx].first_tri = node.left_first;
                if sp == 0 {
                    break;
                }
                sp -= 1;
                let (parent, right_old) = stack[sp];
                node_idx = right_old as usize;
                self.soa_nodes[parent as usize].right = emitted;
            } else {
                let left = self.nodes[node.left_first as usize];
                let right = self.nodes[node.left_first as usize + 1];
                let n = &mut self.soa_nodes[idx];
                n.xxxx = f32x4::from([
                    left.aabb_min.x,
                    left.aabb_max.x,
                    right.aabb_min.x,
                    right.aabb_max.x,
                ]);
                n.yyyy = f32x4::from([
                    left.aabb_min.y,
                    left.aabb_max.y,
                    right.aabb_min.y,
                    right.aabb_max.y,
                ]);
                n.zzzz = f32x4::from([
                    left.aabb_min.z,
                    left.aabb_max.z,
                    right.aabb_min.z,
                    right.aabb_max.z,
                ]);
                n.left = emitted;
                stack[sp] = (idx as u32, node.left_first + 1);
                sp += 1;
                node_idx = node.left_first as usize;
            }
        }
        self.soa_nodes.truncate(emitted as usize);
    }

    /// Node indices are preserved exactly; only parent and sibling links
    /// are added, which is what the optimizer needs.
    fn wald_to_verbose(&mut self) {
        assert!(!self.nodes.is_empty(), "no tree to convert");
        self.verbose.clear();
        self.verbose.resize(self.nodes.len(), VerboseNode::default());
        self.verbose[0].parent = NO_PARENT;
        self.verbose[0].sibling = NO_PARENT;
        let mut node_idx = 0usize;
        let mut parent = NO_PARENT;
        let mut stack = [(0u32, 0u32); 64];
        let mut sp = 0usize;
        loop {
            let node = self.nodes[node_idx];
            let v = &mut self.verbose[node_idx];
            v.aabb_min = node.aabb_min;
            v.aabb_max = node.aabb_max;
            v.tri_count = node.tri_count;
            v.parent = parent;
            if node.is_leaf() {
                v.first_tri = node.left_first;
                if sp == 0 {
                    break;
                }
                sp -= 1;
                let (p, right) = stack[sp];
                parent = p;
                node_idx = right as usize;
            } else {
                v.left = node.left_first;
                v.right = node.left_first + 1;
                self.verbose[node.left_first as usize].sibling = node.left_first + 1;
                self.verbose[node.left_first as usize + 1].sibling = node.left_first;
                stack[sp] = (node_idx as u32, node.left_first + 1);
                sp += 1;
                parent = node_idx as u32;
                node_idx = node.left_first as usize;
            }
        }
    }

    /// Back to the canonical layout: interior nodes are reassigned to
    /// consecutive slot pairs starting at 2, so children are adjacent again.
    fn verbose_to_wald(&mut self) {
        assert!(!self.verbose.is_empty(), "no verbose tree to convert");
        self.nodes.clear();
        self.nodes.resize(self.verbose.len().max(2), BvhNode::default());
        let mut src_stack = [0u32; 64];
        let mut dst_stack = [0u32; 64];
        let mut sp = 0usize;
        let mut src = 0usize;
        let mut dst = 0usize;
        let mut next = 2u32;
        loop {
            let node = self.verbose[src];
            self.nodes[dst].aabb_min = node.aabb_min;
            self.nodes[dst].aabb_max = node.aabb_max;
            if node.is_leaf() {
                self.nodes[dst].tri_count = node.tri_count;
                self.nodes[dst].left_first = node.first_tri;
                if sp == 0 {
                    break;
                }
                sp -= 1;
                src = src_stack[sp] as usize;
                dst = dst_stack[sp] as usize;
            } else {
                self.nodes[dst].left_first = next;
                self.nodes[dst].tri_count = 0;
                src = node.left as usize;
                dst = next as usize;
                next += 1;
                src_stack[sp] = node.right;
                dst_stack[sp] = next;
                next += 1;
                sp += 1;
            }
        }
        self.nodes.truncate((next as usize).max(2));
    }

    /// Interior 4-wide nodes become quantized 64-byte blocks; the triangles
    /// of each leaf child are inlined right after their parent block, with
    /// the original primitive index punned into `v0.w`.
    fn wide4_to_gpu4(&mut self) {
        assert!(!self.wide4.is_empty(), "no 4-wide tree to convert");
        assert!(
            !self.wide4[0].is_leaf(),
            "quantized conversion needs an interior root"
        );
        self.gpu4.clear();
        self.gpu4.reserve(self.wide4.len() * 4 + self.tri_count * 6);
        // pending (childInfo float slot, wide node) pairs
        let mut stack = [(0u32, 0u32); 64];
        let mut sp = 0usize;
        let mut node_idx = 0usize;
        let mut patch_slot = 0u32; // slot 0 is the root's aabb_min.x: "none"
        loop {
            let node = self.wide4[node_idx];
            debug_assert!(!node.is_leaf());
            let base = self.gpu4.len() as u32;
            for _ in 0..4 {
                self.gpu4.push(Vec4::ZERO);
            }
            let mut child_info = [0u32; 4];
            // leaf children first: their triangles go inline after the node
            for i in 0..node.child_count as usize {
                let child = self.wide4[node.child[i] as usize];
                if !child.is_leaf() {
                    continue;
                }
                child_info[i] = gpu4_leaf_info(self.gpu4.len() as u32 - base, child.tri_count);
                for j in 0..child.tri_count {
                    let t = self.tri_idx[(child.first_tri + j) as usize];
                    let vid = t as usize * 3;
                    let mut v0 = self.verts[vid];
                    v0.w = f32::from_bits(t);
                    self.gpu4.push(v0);
                    self.gpu4.push(self.verts[vid + 1]);
                    self.gpu4.push(self.verts[vid + 2]);
                }
            }
            // interior children are emitted later; remember where their
            // block offset has to be written
            for i in 0..node.child_count as usize {
                if self.wide4[node.child[i] as usize].is_leaf() {
                    continue;
                }
                debug_assert!(sp < stack.len());
                stack[sp] = ((base + 3) * 4 + i as u32, node.child[i]);
                sp += 1;
            }
            // quantize the child bounds into 8 bits per axis
            let extent = node.aabb_max - node.aabb_min;
            let scale = Vec3::new(
                if extent.x > 1e-10 { 254.999 / extent.x } else { 0.0 },
                if extent.y > 1e-10 { 254.999 / extent.y } else { 0.0 },
                if extent.z > 1e-10 { 254.999 / extent.z } else { 0.0 },
            );
            let mut qmin = [[0u8; 4]; 3];
            let mut qmax = [[0u8; 4]; 3];
            for i in 0..node.child_count as usize {
                let child = self.wide4[node.child[i] as usize];
                let rel_min = (child.aabb_min - node.aabb_min) * scale;
                let rel_max = (child.aabb_max - node.aabb_min) * scale;
                for a in 0..3 {
                    qmin[a][i] = rel_min[a].floor() as u8;
                    qmax[a][i] = rel_max[a].ceil() as u8;
                }
            }
            let b = base as usize;
            self.gpu4[b] = Vec4::new(
                node.aabb_min.x,
                node.aabb_min.y,
                node.aabb_min.z,
                f32::from_bits(u32::from_le_bytes(qmin[0])),
            );
            self.gpu4[b + 1] = Vec4::new(
                extent.x * (1.0 / 255.0),
                extent.y * (1.0 / 255.0),
                extent.z * (1.0 / 255.0),
                f32::from_bits(u32::from_le_bytes(qmax[0])),
            );
            self.gpu4[b + 2] = Vec4::new(
                f32::from_bits(u32::from_le_bytes(qmin[1])),
                f32::from_bits(u32::from_le_bytes(qmax[1])),
                f32::from_bits(u32::from_le_bytes(qmin[2])),
                f32::from_bits(u32::from_le_bytes(qmax[2])),
            );
            self.gpu4[b + 3] = Vec4::new(
                f32::from_bits(child_info[0]),
                f32::from_bits(child_info[1]),
                f32::from_bits(child_info[2]),
                f32::from_bits(child_info[3]),
            );
            if patch_slot > 0 {
                let (block, lane) = (patch_slot as usize / 4, patch_slot as usize % 4);
                self.gpu4[block][lane] = f32::from_bits(base);
            }
            if sp == 0 {
                break;
            }
            sp -= 1;
            let (slot, child) = stack[sp];
            patch_slot = slot;
            node_idx = child as usize;
        }
    }
}

/// Seed a wide node per binary node (interior ones start with their two
/// children), then greedily let each node adopt the children of its
/// largest-area non-leaf child while capacity allows.
fn collapse_wide<const N: usize>(nodes: &[BvhNode], out: &mut Vec<WideNode<N>>) {
    assert!(!nodes.is_empty(), "no tree to convert");
    out.clear();
    out.resize(nodes.len(), WideNode::default());
    for (i, node) in nodes.iter().enumerate() {
        if i == 1 {
            continue; // reserved slot
        }
        let wide = &mut out[i];
        wide.aabb_min = node.aabb_min;
        wide.aabb_max = node.aabb_max;
        if node.is_leaf() {
            wide.tri_count = node.tri_count;
            wide.first_tri = node.left_first;
        } else {
            wide.child[0] = node.left_first;
            wide.child[1] = node.left_first + 1;
            wide.child_count = 2;
        }
    }
    let mut stack = [0u32; 128];
    let mut sp = 1usize;
    stack[0] = 0;
    while sp > 0 {
        sp -= 1;
        let node_idx = stack[sp] as usize;
        loop {
            let node = out[node_idx];
            let mut best_child = None;
            let mut best_area = 0.0f32;
            for i in 0..node.child_count as usize {
                let child = out[node.child[i] as usize];
                if !child.is_leaf()
                    && node.child_count - 1 + child.child_count <= N as u32
                {
                    let area = child.half_area();
                    if area > best_area {
                        best_area = area;
                        best_child = Some(i);
                    }
                }
            }
            let Some(slot) = best_child else {
                break; // nothing left to adopt
            };
            let adoptee = out[node.child[slot] as usize];
            out[node_idx].child[slot] = adoptee.child[0];
            for i in 1..adoptee.child_count as usize {
                let count = out[node_idx].child_count as usize;
                out[node_idx].child[count] = adoptee.child[i];
                out[node_idx].child_count += 1;
            }
        }
        let node = out[node_idx];
        for i in 0..node.child_count as usize {
            if !out[node.child[i] as usize].is_leaf() {
                debug_assert!(sp < stack.len());
                stack[sp] = node.child[i];
                sp += 1;
            }
        }
    }
}
