use codec::{Read, Result as CodecResult, Write};
use std::collections::HashMap;
use std::collections::hash_map::Iter;
use std::iter::FromIterator;

/// Map from `client` to the next expected clock for that client, i.e. the
/// clock one past the last integrated struct. A derived view over a
/// [`crate::store::StructStore`] - never mutated directly outside of tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateVector(HashMap<u64, u32>);

impl StateVector {
    pub fn new() -> Self {
        StateVector(HashMap::new())
    }

    pub fn get(&self, client: &u64) -> u32 {
        self.0.get(client).copied().unwrap_or(0)
    }

    pub fn set_max(&mut self, client: u64, clock: u32) {
        let e = self.0.entry(client).or_insert(0);
        if *e < clock {
            *e = clock;
        }
    }

    pub fn set_min(&mut self, client: u64, clock: u32) {
        match self.0.get_mut(&client) {
            Some(e) if *e > clock => *e = clock,
            None => {
                self.0.insert(client, clock);
            }
            _ => {}
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, u64, u32> {
        self.0.iter()
    }

    pub fn encode<W: Write>(&self, w: &mut W) {
        w.write_var_u64(self.0.len() as u64);
        for (client, clock) in &self.0 {
            w.write_var_u64(*client);
            w.write_var_u32(*clock);
        }
    }

    pub fn decode<'a, R: Read<'a>>(r: &mut R) -> CodecResult<Self> {
        let len = r.read_var_u64()? as usize;
        let mut map = HashMap::with_capacity(len);
        for _ in 0..len {
            let client = r.read_var_u64()?;
            let clock = r.read_var_u32()?;
            map.insert(client, clock);
        }
        Ok(StateVector(map))
    }
}

impl FromIterator<(u64, u32)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (u64, u32)>>(iter: T) -> Self {
        StateVector(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{DecoderV1, EncoderV1};

    #[test]
    fn roundtrip() {
        let mut sv = StateVector::new();
        sv.set_max(1, 5);
        sv.set_max(2, 9);
        let mut enc = EncoderV1::new();
        sv.encode(&mut enc);
        let bytes = enc.to_vec();
        let mut dec = DecoderV1::new(&bytes);
        let decoded = StateVector::decode(&mut dec).unwrap();
        assert_eq!(decoded.get(&1), 5);
        assert_eq!(decoded.get(&2), 9);
        assert_eq!(decoded.get(&3), 0);
    }

    #[test]
    fn set_max_is_monotonic() {
        let mut sv = StateVector::new();
        sv.set_max(1, 5);
        sv.set_max(1, 3);
        assert_eq!(sv.get(&1), 5);
        sv.set_max(1, 8);
        assert_eq!(sv.get(&1), 8);
    }
}
