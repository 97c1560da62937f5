use crate::*;

use std::io::{self, Write};

/// A flow keyed by source prefix and the taxonomy labels of its endpoints.
pub type PrefixFlow = (Ipv4Prefix, LabelId, LabelId);

/// A flow keyed by an address range instead of a prefix.
pub type RangeFlow = (IpRange, LabelId, LabelId);

/// A parsed flows file. The two record forms never mix within one file.
pub enum FlowFile {
    Prefix(Vec<PrefixFlow>),
    Range(Vec<RangeFlow>),
}

fn parse_device(token: &str, hierarchy: &LabelHierarchy, line: usize) -> Result<LabelId, String> {
    let id: LabelId = token
        .parse()
        .map_err(|e| format!("invalid device id '{token}' on line {line}: {e}"))?;
    if id >= hierarchy.len() {
        return Err(format!(
            "device id {id} on line {line} is outside the hierarchy (has {} labels)",
            hierarchy.len()
        ));
    }
    Ok(id)
}

/// Parses a flows file, sniffing the record form from the first line:
/// `<prefix>/<len> <src_id> <dst_id>` or `<begin> <end> <src_id> <dst_id>`.
pub fn parse_flows(s: &str, hierarchy: &LabelHierarchy) -> Result<FlowFile, String> {
    let first = s.lines().next().ok_or("flows file is empty")?;
    let prefix_form = first
        .split_whitespace()
        .next()
        .is_some_and(|token| token.contains('/'));

    if prefix_form {
        let mut flows = Vec::new();
        for (i, line) in s.lines().enumerate() {
            let i = i + 1;
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [prefix, src, dst] = fields.as_slice() else {
                return Err(format!("expected '<prefix> <src> <dst>' on line {i}"));
            };
            let prefix: Ipv4Prefix = prefix.parse().map_err(|e| format!("line {i}: {e}"))?;
            flows.push((
                prefix,
                parse_device(src, hierarchy, i)?,
                parse_device(dst, hierarchy, i)?,
            ));
        }
        Ok(FlowFile::Prefix(flows))
    } else {
        let mut flows = Vec::new();
        for (i, line) in s.lines().enumerate() {
            let i = i + 1;
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [begin, end, src, dst] = fields.as_slice() else {
                return Err(format!("expected '<begin> <end> <src> <dst>' on line {i}"));
            };
            let begin: u32 = begin
                .parse()
                .map_err(|e| format!("invalid range begin on line {i}: {e}"))?;
            let end: u32 = end
                .parse()
                .map_err(|e| format!("invalid range end on line {i}: {e}"))?;
            if end < begin {
                return Err(format!("empty range [{begin}, {end}] on line {i}"));
            }
            flows.push((
                IpRange::new(begin, end),
                parse_device(src, hierarchy, i)?,
                parse_device(dst, hierarchy, i)?,
            ));
        }
        Ok(FlowFile::Range(flows))
    }
}

/// One parent id per line, 1:1 with the clusters file.
pub fn write_parents(out: &mut dyn Write, parents: &[usize]) -> io::Result<()> {
    for p in parents {
        writeln!(out, "{p}")?;
    }
    Ok(())
}

/// Formatting hooks for the flow label types the front end clusters.
pub trait FlowLabel: Clone + PartialEq + Send + Sync {
    /// The machine-readable `clusters.txt` record for one cluster.
    fn write_cluster(cluster: &CostLabel<Self>, out: &mut dyn Write) -> io::Result<()>;

    /// The human-readable rendition, with device ids resolved to names.
    fn write_hr_cluster(
        cluster: &CostLabel<Self>,
        hierarchy: &LabelHierarchy,
        out: &mut dyn Write,
    ) -> io::Result<()>;
}

impl FlowLabel for PrefixFlow {
    fn write_cluster(cluster: &CostLabel<Self>, out: &mut dyn Write) -> io::Result<()> {
        let (prefix, src, dst) = &cluster.label;
        writeln!(out, "{} {} {} {}", cluster.cost, prefix, src, dst)
    }

    fn write_hr_cluster(
        cluster: &CostLabel<Self>,
        hierarchy: &LabelHierarchy,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let (prefix, src, dst) = &cluster.label;
        writeln!(
            out,
            "{{{},[{},{},{},]}}",
            cluster.cost,
            prefix,
            hierarchy.id_to_name(*src),
            hierarchy.id_to_name(*dst)
        )
    }
}

impl FlowLabel for RangeFlow {
    fn write_cluster(cluster: &CostLabel<Self>, out: &mut dyn Write) -> io::Result<()> {
        let (range, src, dst) = &cluster.label;
        writeln!(
            out,
            "{} {} {} {} {}",
            cluster.cost, range.begin, range.end, src, dst
        )
    }

    fn write_hr_cluster(
        cluster: &CostLabel<Self>,
        hierarchy: &LabelHierarchy,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let (range, src, dst) = &cluster.label;
        writeln!(
            out,
            "{{{},[{},{},{},]}}",
            cluster.cost,
            range,
            hierarchy.id_to_name(*src),
            hierarchy.id_to_name(*dst)
        )
    }
}

pub fn write_clusters<L: FlowLabel>(
    out: &mut dyn Write,
    clusters: &[CostLabel<L>],
) -> io::Result<()> {
    for cluster in clusters {
        L::write_cluster(cluster, out)?;
    }
    Ok(())
}

pub fn write_hr_clusters<L: FlowLabel>(
    out: &mut dyn Write,
    clusters: &[CostLabel<L>],
    hierarchy: &LabelHierarchy,
) -> io::Result<()> {
    for cluster in clusters {
        L::write_hr_cluster(cluster, hierarchy, out)?;
    }
    Ok(())
}
