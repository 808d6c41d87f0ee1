use crate::{EXTENDED_PO, MAX_PO, SwarmAddress};

pub trait Proximity {
    fn proximity(&self, other: &SwarmAddress) -> u8;
    fn extended_proximity(&self, other: &SwarmAddress) -> u8;
}

impl Proximity for SwarmAddress {
    fn proximity(&self, other: &SwarmAddress) -> u8 {
        proximity_impl(self.as_bytes(), other.as_bytes(), MAX_PO)
    }

    fn extended_proximity(&self, other: &SwarmAddress) -> u8 {
        proximity_impl(self.as_bytes(), other.as_bytes(), EXTENDED_PO)
    }
}

/// Proximity order of two addresses, capped at [`MAX_PO`].
pub fn proximity(one: &SwarmAddress, other: &SwarmAddress) -> u8 {
    one.proximity(other)
}

// Proximity returns the proximity order of the MSB distance between x and y
//
// The distance metric MSB(x, y) of two equal length bit sequences x an y is the
// value of the binary integer cast of the x^y, ie., x and y bitwise xor-ed.
// the binary cast is big endian: most significant bit first (=MSB).
//
// Proximity(x, y) is a discrete logarithmic scaling of the MSB distance.
// It is calculated by counting the number of common leading zeros in the (MSB)
// binary representation of the x^y.
//
// (0 farthest, max_po closest)
fn proximity_impl(one: &[u8], other: &[u8], max_po: u8) -> u8 {
    let bytes = (max_po as usize / 8 + 1).min(one.len()).min(other.len());
    for (i, (a, b)) in one.iter().zip(other).take(bytes).enumerate() {
        let oxo = a ^ b;
        if oxo != 0 {
            let po = (i * 8) as u8 + oxo.leading_zeros() as u8;
            return po.min(max_po);
        }
    }
    max_po
}
