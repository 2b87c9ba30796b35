use std::sync::Arc;

use rand::Rng;

use crate::instance::Instance;

/// Weighted random selection without replacement over the candidates of
/// one call. Zero-weight instances are never returned.
pub struct WeightedBalancer {
    instances: Vec<Arc<Instance>>,
    weights: Vec<u64>,
    sum: u64,
    cursor: usize,
}

impl WeightedBalancer {
    pub fn new(instances: Vec<Arc<Instance>>) -> Self {
        let weights: Vec<u64> = instances.iter().map(|i| i.weight() as u64).collect();
        let sum = weights.iter().sum();
        Self { instances, weights, sum, cursor: 0 }
    }

    /// Instances not yet handed out.
    pub fn remaining(&self) -> usize {
        self.instances.len() - self.cursor
    }

    pub fn select_one(&mut self) -> Option<Arc<Instance>> {
        self.select_with(&mut rand::rng())
    }

    pub fn select_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Arc<Instance>> {
        if self.cursor >= self.instances.len() || self.sum == 0 {
            return None;
        }
        let mut r = rng.random_range(0..self.sum);
        let mut picked = self.cursor;
        for i in self.cursor..self.instances.len() {
            if r < self.weights[i] {
                picked = i;
                break;
            }
            r -= self.weights[i];
        }
        self.instances.swap(self.cursor, picked);
        self.weights.swap(self.cursor, picked);
        self.sum -= self.weights[self.cursor];
        let ins = self.instances[self.cursor].clone();
        self.cursor += 1;
        Some(ins)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn ins(host: &str, weight: &str) -> Arc<Instance> {
        Arc::new(Instance::new(host, 80, HashMap::new()).with_tag("weight", weight))
    }

    #[test]
    fn test_frequency_follows_weight() {
        let mut rng = StdRng::seed_from_u64(7);
        let set = vec![ins("a", "100"), ins("b", "300"), ins("c", "0")];
        let mut hits: HashMap<String, u32> = HashMap::new();
        let trials = 40_000;
        for _ in 0..trials {
            let mut lb = WeightedBalancer::new(set.clone());
            let first = lb.select_with(&mut rng).unwrap();
            *hits.entry(first.host().to_string()).or_default() += 1;
        }
        let share_b = hits["b"] as f64 / trials as f64;
        assert!((share_b - 0.75).abs() < 0.02, "b share {share_b}");
        assert!(!hits.contains_key("c"));
    }

    #[test]
    fn test_without_replacement() {
        let mut lb = WeightedBalancer::new(vec![ins("a", "1"), ins("b", "1"), ins("c", "1")]);
        let mut seen: Vec<String> = std::iter::from_fn(|| lb.select_one())
            .map(|i| i.host().to_string())
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(lb.remaining(), 0);
        assert!(lb.select_one().is_none());
    }

    #[test]
    fn test_zero_weight_never_selected() {
        let mut lb = WeightedBalancer::new(vec![ins("a", "0"), ins("b", "10"), ins("c", "0")]);
        assert_eq!(lb.select_one().unwrap().host(), "b");
        assert!(lb.select_one().is_none());
        assert_eq!(lb.remaining(), 2);
    }

    #[test]
    fn test_default_weight() {
        let mut lb = WeightedBalancer::new(vec![Arc::new(Instance::new("a", 80, HashMap::new()))]);
        assert_eq!(lb.select_one().unwrap().weight(), 100);
        assert!(WeightedBalancer::new(vec![]).select_one().is_none());
    }
}
