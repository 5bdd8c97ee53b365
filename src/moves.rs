use std::fmt::{Debug};
use std::hash::{Hash};

use indexmap::{IndexMap};

/**
 * Find a sequence of moves to implement the specified mapping `dest_to_src`.
 * Returns a sequence of (dest, src) pairs.
 *
 *  - dest_to_src - for each destination V, the corresponding source V.
 *  - temp - a temporary location used to break cycles. It must not appear
 *    in `dest_to_src`.
 *
 * The moves come out in an order that depends only on the insertion order of
 * `dest_to_src`, so that the emitted code is reproducible.
 */
pub fn moves<V: Debug + Clone + Hash + Eq>(
    mut dest_to_src: IndexMap<V, V>,
    temp: &V,
) -> impl Iterator<Item=(V, V)> {
    // Make a work list that won't change as we remove elements from the map.
    let dests: Vec<V> = dest_to_src.iter().map(|(dest, src)| {
        assert_ne!(src, temp);
        assert_ne!(dest, temp);
        dest.clone()
    }).collect();
    let mut moves: Vec<(V, V)> = Vec::new(); // In reverse order.
    let mut chain: Vec<V> = Vec::new(); // In forwards order.
    for mut current in dests {
        // Follow the chain starting at `current`.
        while let Some(src) = dest_to_src.shift_remove(&current) {
            if src == current { break; }
            chain.push(current);
            current = src;
        }
        // If the chain ended with a non-trivial cycle, break it.
        let cycle = chain.iter().find(|&dest: &&V| dest == &current).cloned();
        if cycle.is_some() {
            current = temp.clone();
        }
        while let Some(dest) = chain.pop() {
            moves.push((dest.clone(), current));
            current = dest;
        }
        if let Some(src) = cycle {
            moves.push((temp.clone(), src));
        }
        assert_eq!(chain.len(), 0);
    }
    moves.into_iter().rev()
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn swap() {
        let dest_to_src: IndexMap<u8, u8> = [(0, 1), (1, 0)].into_iter().collect();
        let observed: Vec<_> = moves(dest_to_src, &9).collect();
        assert_eq!(observed, vec![(9, 0), (0, 1), (1, 9)]);
    }

    #[test]
    fn chain_without_temp() {
        // r2 <- r1 <- r0 must read r1 before overwriting it.
        let dest_to_src: IndexMap<u8, u8> = [(1, 0), (2, 1)].into_iter().collect();
        let observed: Vec<_> = moves(dest_to_src, &9).collect();
        assert_eq!(observed, vec![(2, 1), (1, 0)]);
    }

    #[test]
    fn all_small() {
        const N: usize = 5;
        const N1: usize = N + 1;
        let mut input = [0; N1];
        for src in 0..N1 {
            input[src] = src + 10;
        }
        for test in 0..(N1.pow(N as u32)) {
            let mut dest_to_src = IndexMap::new();
            let mut i = test;
            for dest in 0..N {
                let src = i % N1;
                i /= N1;
                if src < N {
                    dest_to_src.insert(dest, src);
                }
            }
            let mut expected = input;
            for (&dest, &src) in &dest_to_src {
                expected[dest] = input[src]
            }
            let pairs: Vec<_> = moves(dest_to_src, &N).collect();
            let mut observed = input;
            for &(dest, src) in &pairs {
                observed[dest] = observed[src];
            }
            assert_eq!(expected[..N], observed[..N], "test case {}: {:?}", test, pairs);
        }
    }

    /** Random permutations with copies, on more locations than `all_small()` can afford. */
    #[test]
    fn random() {
        use rand::{SeedableRng};
        use rand::distributions::{Distribution, Uniform};
        const N: usize = 16;
        let mut rng = rand_pcg::Pcg64::seed_from_u64(0);
        let location = Uniform::new(0, N);
        for test in 0..1000 {
            let mut dest_to_src = IndexMap::new();
            for _ in 0..location.sample(&mut rng) {
                dest_to_src.insert(location.sample(&mut rng), location.sample(&mut rng));
            }
            let input: Vec<usize> = (0..=N).map(|i| i + 100).collect();
            let mut expected = input.clone();
            for (&dest, &src) in &dest_to_src {
                expected[dest] = input[src];
            }
            let pairs: Vec<_> = moves(dest_to_src, &N).collect();
            let mut observed = input.clone();
            for &(dest, src) in &pairs {
                observed[dest] = observed[src];
            }
            assert_eq!(expected[..N], observed[..N], "test case {}: {:?}", test, pairs);
        }
    }
}
