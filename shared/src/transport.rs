/// Per-message transport parameters: a *preferred*, not guaranteed, delivery
/// channel. A sender hinting `UnreliableOrdered` while no datagram channel is
/// active will have its message delivered reliably and the annotation
/// corrected to reflect what actually happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    UnreliableUnordered,
    UnreliableOrdered,
    ReliableUnordered,
    ReliableOrdered,
}

impl Transport {
    /// The default mode of transport.
    pub const DEFAULT: Transport = Transport::ReliableOrdered;

    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Transport::ReliableUnordered | Transport::ReliableOrdered
        )
    }

    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            Transport::UnreliableOrdered | Transport::ReliableOrdered
        )
    }

    /// Returns a transport satisfying the requirements of both this and the
    /// other transport.
    pub fn combine(self, other: Transport) -> Transport {
        match (self.is_reliable() || other.is_reliable(), self.is_ordered() || other.is_ordered()) {
            (true, true) => Transport::ReliableOrdered,
            (true, false) => Transport::ReliableUnordered,
            (false, true) => Transport::UnreliableOrdered,
            (false, false) => Transport::UnreliableUnordered,
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Transport::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_takes_the_stronger_guarantees() {
        assert_eq!(
            Transport::UnreliableUnordered.combine(Transport::ReliableOrdered),
            Transport::ReliableOrdered
        );
        assert_eq!(
            Transport::UnreliableOrdered.combine(Transport::ReliableUnordered),
            Transport::ReliableOrdered
        );
        assert_eq!(
            Transport::UnreliableUnordered.combine(Transport::UnreliableUnordered),
            Transport::UnreliableUnordered
        );
    }
}
