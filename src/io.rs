use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use itertools::Itertools;

use crate::error::Error;
use crate::hypergraph::Hypergraph;
use crate::{BlockId, NodeId, Weight};

// Lines starting with '%' are comments in both formats.
fn content_lines(input: &str) -> impl Iterator<Item = &str> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('%'))
}

fn parse_numbers(line: &str) -> Result<Vec<i64>, Error> {
    line.split_whitespace()
        .map(|token| {
            token
                .parse::<i64>()
                .map_err(|_| Error::InvalidInput(format!("malformed number '{token}'")))
        })
        .collect()
}

/// Parses a hypergraph in hMETIS format: a header `M N [fmt]` followed by
/// one line of 1-indexed pins per hyperedge. fmt 1 carries edge weights,
/// fmt 10 node weights, fmt 11 both.
pub fn parse_hmetis(input: &str) -> Result<Hypergraph, Error> {
    let mut lines = content_lines(input);
    let header = parse_numbers(
        lines.next().ok_or_else(|| Error::InvalidInput("empty hypergraph file".to_string()))?,
    )?;
    if header.len() < 2 {
        return Err(Error::InvalidInput("hMETIS header needs at least M and N".to_string()));
    }
    let num_edges = header[0] as usize;
    let num_nodes = header[1] as usize;
    let fmt = header.get(2).copied().unwrap_or(0);
    let has_edge_weights = fmt % 10 == 1;
    let has_node_weights = (fmt / 10) % 10 == 1;

    let mut edges = Vec::with_capacity(num_edges);
    let mut edge_weights = has_edge_weights.then(|| Vec::with_capacity(num_edges));
    for e in 0..num_edges {
        let numbers = parse_numbers(
            lines
                .next()
                .ok_or_else(|| Error::InvalidInput(format!("missing hyperedge line {e}")))?,
        )?;
        let mut pins = numbers.as_slice();
        if let Some(ref mut weights) = edge_weights {
            let (&weight, rest) = pins
                .split_first()
                .ok_or_else(|| Error::InvalidInput(format!("hyperedge {e} has no pins")))?;
            weights.push(weight);
            pins = rest;
        }
        let pins: Vec<NodeId> = pins
            .iter()
            .map(|&p| {
                if p < 1 || p as usize > num_nodes {
                    Err(Error::InvalidInput(format!("pin {p} of hyperedge {e} out of range")))
                } else {
                    Ok((p - 1) as NodeId)
                }
            })
            .try_collect()?;
        edges.push(pins);
    }

    let node_weights = if has_node_weights {
        let mut weights = Vec::with_capacity(num_nodes);
        for u in 0..num_nodes {
            let numbers = parse_numbers(
                lines
                    .next()
                    .ok_or_else(|| Error::InvalidInput(format!("missing weight of vertex {u}")))?,
            )?;
            weights.push(numbers[0]);
        }
        Some(weights)
    } else {
        None
    };

    Hypergraph::new(num_nodes, edges, edge_weights, node_weights)
}

/// Parses a graph in METIS format as a 2-uniform hypergraph: a header
/// `N M [fmt]` followed by one adjacency line per vertex (1-indexed). Every
/// undirected edge appears once as a two-pin hyperedge.
pub fn parse_metis(input: &str) -> Result<Hypergraph, Error> {
    let mut lines = content_lines(input);
    let header = parse_numbers(
        lines.next().ok_or_else(|| Error::InvalidInput("empty graph file".to_string()))?,
    )?;
    if header.len() < 2 {
        return Err(Error::InvalidInput("METIS header needs at least N and M".to_string()));
    }
    let num_nodes = header[0] as usize;
    let num_edges = header[1] as usize;
    let fmt = header.get(2).copied().unwrap_or(0);
    let has_edge_weights = fmt % 10 == 1;
    let has_node_weights = (fmt / 10) % 10 == 1;

    let mut edges: Vec<Vec<NodeId>> = Vec::with_capacity(num_edges);
    let mut edge_weights = has_edge_weights.then(|| Vec::with_capacity(num_edges));
    let mut node_weights = has_node_weights.then(|| Vec::with_capacity(num_nodes));

    for u in 0..num_nodes {
        let numbers = parse_numbers(
            lines
                .next()
                .ok_or_else(|| Error::InvalidInput(format!("missing adjacency of vertex {u}")))?,
        )?;
        let mut tokens = numbers.as_slice();
        if let Some(ref mut weights) = node_weights {
            let (&weight, rest) = tokens
                .split_first()
                .ok_or_else(|| Error::InvalidInput(format!("missing weight of vertex {u}")))?;
            weights.push(weight);
            tokens = rest;
        }
        let mut index = 0;
        while index < tokens.len() {
            let neighbor = tokens[index];
            if neighbor < 1 || neighbor as usize > num_nodes {
                return Err(Error::InvalidInput(format!(
                    "neighbor {neighbor} of vertex {u} out of range"
                )));
            }
            let v = (neighbor - 1) as NodeId;
            let weight = if has_edge_weights {
                index += 1;
                *tokens.get(index).ok_or_else(|| {
                    Error::InvalidInput(format!("missing edge weight for vertex {u}"))
                })?
            } else {
                1
            };
            // Each undirected edge is listed twice; keep the u < v copy.
            if (u as NodeId) < v {
                edges.push(vec![u as NodeId, v]);
                if let Some(ref mut weights) = edge_weights {
                    weights.push(weight);
                }
            }
            index += 1;
        }
    }

    if edges.len() != num_edges {
        return Err(Error::InvalidInput(format!(
            "METIS header promises {num_edges} edges, adjacency lists yield {}",
            edges.len()
        )));
    }
    Hypergraph::new(num_nodes, edges, edge_weights, node_weights)
}

pub fn read_hmetis_file(path: &Path) -> Result<Hypergraph, Error> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::InvalidInput(format!("cannot read {}: {e}", path.display())))?;
    parse_hmetis(&content)
}

pub fn read_metis_file(path: &Path) -> Result<Hypergraph, Error> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::InvalidInput(format!("cannot read {}: {e}", path.display())))?;
    parse_metis(&content)
}

/// Writes a partition: one 0-indexed block id per vertex per line.
pub fn write_partition(path: &Path, partition: &[BlockId]) -> Result<(), std::io::Error> {
    let mut file = BufWriter::new(File::create(path)?);
    for &block in partition {
        writeln!(file, "{block}")?;
    }
    Ok(())
}

pub fn read_partition(path: &Path) -> Result<Vec<BlockId>, Error> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::InvalidInput(format!("cannot read {}: {e}", path.display())))?;
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<BlockId>()
                .map_err(|_| Error::InvalidInput(format!("malformed block id '{line}'")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_hmetis_toy() {
        // The 7-vertex, 4-edge instance in plain hMETIS format.
        let content = "\
            % toy hypergraph\n\
            4 7\n\
            1 3\n\
            1 2 4 5\n\
            4 5 7\n\
            3 6 7\n";
        let hg = parse_hmetis(content).unwrap();
        assert_eq!(hg.initial_num_nodes(), 7);
        assert_eq!(hg.initial_num_edges(), 4);
        assert_eq!(hg.initial_num_pins(), 12);
        assert_eq!(hg.total_weight(), 7);
        assert_eq!(hg.pins(1), &[0, 1, 3, 4]);
    }

    #[test]
    fn test_parse_hmetis_with_weights() {
        let content = "\
            3 4 11\n\
            7 1 2\n\
            2 2 3\n\
            9 3 4\n\
            1\n\
            2\n\
            3\n\
            4\n";
        let hg = parse_hmetis(content).unwrap();
        assert_eq!(hg.edge_weight(0), 7);
        assert_eq!(hg.edge_weight(2), 9);
        assert_eq!(hg.node_weight(3), 4);
        assert_eq!(hg.total_weight(), 10);
    }

    #[test]
    fn test_parse_hmetis_rejects_bad_pins() {
        assert!(parse_hmetis("1 3\n1 4\n").is_err());
        assert!(parse_hmetis("1 3\n0 1\n").is_err());
        assert!(parse_hmetis("").is_err());
    }

    #[test]
    fn test_parse_metis_four_cycle() {
        let content = "\
            4 4\n\
            2 4\n\
            1 3\n\
            2 4\n\
            1 3\n";
        let hg = parse_metis(content).unwrap();
        assert_eq!(hg.initial_num_nodes(), 4);
        assert_eq!(hg.initial_num_edges(), 4);
        assert!(hg.is_graph());
    }

    #[test]
    fn test_parse_metis_with_node_weights() {
        let content = "\
            3 2 10\n\
            5 2\n\
            1 1 3\n\
            2 2\n";
        let hg = parse_metis(content).unwrap();
        assert_eq!(hg.node_weight(0), 5);
        assert_eq!(hg.node_weight(2), 2);
        assert_eq!(hg.initial_num_edges(), 2);
    }

    #[test]
    fn test_parse_metis_detects_edge_count_mismatch() {
        let content = "\
            3 5\n\
            2\n\
            1 3\n\
            2\n";
        assert!(parse_metis(content).is_err());
    }

    #[test]
    fn test_partition_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("toy.part");
        let partition = vec![0, 1, 1, 0, 2, 2, 0];

        write_partition(&path, &partition).unwrap();
        let read_back = read_partition(&path).unwrap();

        assert_eq!(partition, read_back);
    }

    #[test]
    fn test_partition_round_trip_preserves_objective() {
        use crate::partitioned::PartitionedHypergraph;

        let content = "4 7\n1 3\n1 2 4 5\n4 5 7\n3 6 7\n";
        let hg = parse_hmetis(content).unwrap();
        let partition = vec![0, 0, 1, 0, 0, 1, 1];
        let phg = PartitionedHypergraph::new(&hg, 2);
        phg.apply_partition(&partition);
        let objective = crate::metrics::km1(&phg);

        let dir = tempdir().unwrap();
        let path = dir.path().join("toy.part");
        write_partition(&path, &partition).unwrap();
        let read_back = read_partition(&path).unwrap();

        let fresh = PartitionedHypergraph::new(&hg, 2);
        fresh.apply_partition(&read_back);
        assert_eq!(read_back, partition);
        assert_eq!(crate::metrics::km1(&fresh), objective);
    }
}
