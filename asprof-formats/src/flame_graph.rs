//! Flame graph builder. Stacks are merged into a trie keyed by
//! `(name index, frame kind)`; the trie is rendered into a self-contained
//! HTML document by substituting the frame data into an embedded asset.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{self, Write};

use indexmap::IndexSet;

static FLAME_HTML: &str = include_str!("../assets/flame.html");

/// Frame kinds the renderer distinguishes by color. The numeric values index
/// the palette table in the HTML asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameKind {
    Interpreted = 0,
    C1Compiled = 1,
    JitCompiled = 2,
    Inlined = 3,
    Native = 4,
    Cpp = 5,
    Kernel = 6,
}

/// What the sample weights mean; shown in frame tooltips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Samples,
    Total,
}

impl Counter {
    fn units(self) -> &'static str {
        match self {
            Counter::Samples => "samples",
            Counter::Total => "total",
        }
    }
}

// Child key: low 28 bits name index, high 4 bits frame kind.
const NAME_MASK: u32 = (1 << 28) - 1;

#[derive(Default)]
struct Trie {
    children: BTreeMap<u32, Trie>,
    total: u64,
    self_weight: u64,
    // Per-kind weights used to pick a representative color when a frame
    // was sampled in several compilation states.
    inlined: u64,
    c1_compiled: u64,
    interpreted: u64,
}

impl Trie {
    fn child(&mut self, name_index: u32, kind: FrameKind) -> &mut Trie {
        self.children
            .entry(name_index | (kind as u32) << 28)
            .or_default()
    }

    fn kind(&self, key: u32) -> FrameKind {
        if self.inlined * 3 >= self.total {
            FrameKind::Inlined
        } else if self.c1_compiled * 2 >= self.total {
            FrameKind::C1Compiled
        } else if self.interpreted * 2 >= self.total {
            FrameKind::Interpreted
        } else {
            match key >> 28 {
                0 => FrameKind::Interpreted,
                1 => FrameKind::C1Compiled,
                3 => FrameKind::Inlined,
                4 => FrameKind::Native,
                5 => FrameKind::Cpp,
                6 => FrameKind::Kernel,
                _ => FrameKind::JitCompiled,
            }
        }
    }

    fn depth(&self, cutoff: u64) -> usize {
        let mut max_depth = 0;
        for child in self.children.values() {
            if child.total >= cutoff {
                max_depth = max_depth.max(child.depth(cutoff));
            }
        }
        max_depth + 1
    }
}

pub struct FlameGraph {
    root: Trie,
    cpool: IndexSet<String>,
    title: String,
    counter: Counter,
    minwidth: f64,
    reverse: bool,
}

impl FlameGraph {
    pub fn new(title: &str, counter: Counter, minwidth: f64, reverse: bool) -> Self {
        let mut cpool = IndexSet::new();
        cpool.insert("all".to_owned());
        FlameGraph {
            root: Trie::default(),
            cpool,
            title: title.to_owned(),
            counter,
            minwidth,
            reverse,
        }
    }

    /// Adds one stack, frames ordered root first. Reversed ("icicle") output
    /// is a rendering choice; the caller does not need to flip the frames.
    pub fn add_sample(&mut self, frames: &[(&str, FrameKind)], weight: u64) {
        if weight == 0 {
            return;
        }
        self.root.total += weight;
        let mut node = &mut self.root;
        for &(name, kind) in frames {
            let name_index = match self.cpool.get_index_of(name) {
                Some(index) => index as u32,
                None => self.cpool.insert_full(name.to_owned()).0 as u32,
            };
            node = node.child(name_index, kind);
            node.total += weight;
            match kind {
                FrameKind::Inlined => node.inlined += weight,
                FrameKind::C1Compiled => node.c1_compiled += weight,
                FrameKind::Interpreted => node.interpreted += weight,
                _ => {}
            }
        }
        node.self_weight += weight;
    }

    pub fn total(&self) -> u64 {
        self.root.total
    }

    /// Renders the flame graph HTML document.
    pub fn dump<W: Write>(&self, mut out: W) -> io::Result<()> {
        let cutoff = ((self.root.total as f64) * self.minwidth / 100.0) as u64;
        let depth = self.root.depth(cutoff.max(1));

        let mut levels: Vec<String> = vec![String::new(); depth];
        // The root spans the whole width under the synthetic "all" name.
        let _ = write!(
            levels[0],
            "[{{left:0,width:{},type:{},title:0}}",
            self.root.total,
            FrameKind::Native as u32
        );
        self.emit_children(&self.root, 1, 0, cutoff.max(1), &mut levels);
        for level in &mut levels {
            if level.is_empty() {
                level.push('[');
            }
            level.push(']');
        }

        let mut cpool_js = String::new();
        for (i, name) in self.cpool.iter().enumerate() {
            if i > 0 {
                cpool_js.push(',');
            }
            cpool_js.push('\'');
            escape_js(&mut cpool_js, name);
            cpool_js.push('\'');
        }

        let html = FLAME_HTML
            .replace("/*title:*/", &escaped(&self.title))
            .replace("/*count:*/", self.counter.units())
            .replace("/*reverse:*/", if self.reverse { "true" } else { "false" })
            .replace("/*depth:*/", &depth.to_string())
            .replace("/*cpool:*/", &cpool_js)
            .replace("[/*frames:*/]", &format!("[{}]", levels.join(",\n")));
        out.write_all(html.as_bytes())
    }

    fn emit_children(&self, node: &Trie, level: usize, x: u64, cutoff: u64, levels: &mut Vec<String>) {
        let mut x = x + node.self_weight;
        for (&key, child) in &node.children {
            if child.total < cutoff {
                x += child.total;
                continue;
            }
            let kind = child.kind(key);
            let sep = if levels[level].is_empty() { "[" } else { "," };
            let _ = write!(
                levels[level],
                "{sep}{{left:{x},width:{},type:{},title:{}}}",
                child.total,
                kind as u32,
                key & NAME_MASK
            );
            if level + 1 < levels.len() {
                self.emit_children(child, level + 1, x, cutoff, levels);
            }
            x += child.total;
        }
    }

    /// Renders a call-tree HTML document: nested lists with percentages,
    /// heaviest children first.
    pub fn dump_tree<W: Write>(&self, mut out: W) -> io::Result<()> {
        writeln!(
            out,
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
             <title>{}</title>\n<style>body{{font:12px monospace}} \
             ul{{list-style:none;margin:0;padding-left:16px}}</style></head><body>",
            escaped(&self.title)
        )?;
        writeln!(out, "<p>Total: {} {}</p>", self.root.total, self.counter.units())?;
        self.print_tree_node(&mut out, &self.root)?;
        writeln!(out, "</body></html>")
    }

    fn print_tree_node<W: Write>(&self, out: &mut W, node: &Trie) -> io::Result<()> {
        let mut children: Vec<(&u32, &Trie)> = node.children.iter().collect();
        children.sort_by(|a, b| b.1.total.cmp(&a.1.total));

        if children.is_empty() {
            return Ok(());
        }
        writeln!(out, "<ul>")?;
        let total = self.root.total.max(1);
        for (&key, child) in children {
            let name = self
                .cpool
                .get_index((key & NAME_MASK) as usize)
                .map(String::as_str)
                .unwrap_or("?");
            writeln!(
                out,
                "<li>[{:.2}%] {} ({})",
                child.total as f64 * 100.0 / total as f64,
                escaped(name),
                child.total
            )?;
            self.print_tree_node(out, child)?;
            writeln!(out, "</li>")?;
        }
        writeln!(out, "</ul>")
    }
}

fn escaped(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            _ => out.push(ch),
        }
    }
    out
}

fn escape_js(out: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '/' => out.push_str("\\/"),
            _ => out.push(ch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_common_prefixes() {
        let mut fg = FlameGraph::new("test", Counter::Samples, 0.0, false);
        fg.add_sample(&[("main", FrameKind::Native), ("a", FrameKind::JitCompiled)], 3);
        fg.add_sample(&[("main", FrameKind::Native), ("b", FrameKind::JitCompiled)], 2);
        assert_eq!(fg.total(), 5);

        let mut html = Vec::new();
        fg.dump(&mut html).unwrap();
        let html = String::from_utf8(html).unwrap();
        // One "main" frame spanning both children.
        assert!(html.contains("width:5"));
        assert!(html.contains("'main'"));
        assert!(html.contains("'a'") && html.contains("'b'"));
    }

    #[test]
    fn majority_inlined_recolors_frame() {
        let mut fg = FlameGraph::new("test", Counter::Samples, 0.0, false);
        fg.add_sample(&[("hot", FrameKind::Inlined)], 2);
        fg.add_sample(&[("hot", FrameKind::JitCompiled)], 1);

        let mut html = Vec::new();
        fg.dump(&mut html).unwrap();
        let html = String::from_utf8(html).unwrap();
        assert!(html.contains(&format!("type:{}", FrameKind::Inlined as u32)));
    }

    #[test]
    fn minwidth_prunes_narrow_frames() {
        let mut fg = FlameGraph::new("test", Counter::Samples, 10.0, false);
        fg.add_sample(&[("wide", FrameKind::JitCompiled)], 99);
        fg.add_sample(&[("narrow", FrameKind::JitCompiled)], 1);

        let mut html = Vec::new();
        fg.dump(&mut html).unwrap();
        let html = String::from_utf8(html).unwrap();
        assert!(html.contains("'wide'"));
        assert!(!html.contains("{left:99,width:1"));
    }

    #[test]
    fn names_are_escaped_for_js() {
        let mut fg = FlameGraph::new("t", Counter::Samples, 0.0, false);
        fg.add_sample(&[("List<String>.add('x')", FrameKind::JitCompiled)], 1);
        let mut html = Vec::new();
        fg.dump(&mut html).unwrap();
        let html = String::from_utf8(html).unwrap();
        assert!(html.contains("List<String>.add(\\'x\\')"));
    }
}
