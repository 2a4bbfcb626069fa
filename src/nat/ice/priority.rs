// src/nat/ice/priority.rs
//! ICE priority calculation (RFC 8445 Section 5.1.2 and 6.1.2.3)

use super::CandidateType;

/// Type preferences as per RFC 8445
pub const TYPE_PREFERENCE_HOST: u32 = 126;
pub const TYPE_PREFERENCE_PRFLX: u32 = 110;
pub const TYPE_PREFERENCE_SRFLX: u32 = 100;
pub const TYPE_PREFERENCE_RELAY: u32 = 0;

/// Maximum values for validation
pub const MAX_LOCAL_PREFERENCE: u32 = 65535;
pub const MAX_COMPONENT_ID: u32 = 256;

/// Type preference for a candidate type
pub fn get_type_preference(candidate_type: CandidateType) -> u32 {
    match candidate_type {
        CandidateType::Host => TYPE_PREFERENCE_HOST,
        CandidateType::PeerReflexive => TYPE_PREFERENCE_PRFLX,
        CandidateType::ServerReflexive => TYPE_PREFERENCE_SRFLX,
        CandidateType::Relay => TYPE_PREFERENCE_RELAY,
    }
}

/// Candidate priority per RFC 8445 Section 5.1.2.1
///
/// priority = (2^24)*(type preference) +
///            (2^8)*(local preference) +
///            (2^0)*(256 - component ID)
///
/// Out-of-range inputs are clamped: local preference to 65535 and the
/// component id to 1..=256.
pub fn calculate_priority(candidate_type: CandidateType, local_preference: u32, component_id: u32) -> u32 {
    let type_pref = get_type_preference(candidate_type);
    let local_pref = local_preference.min(MAX_LOCAL_PREFERENCE);
    let component = component_id.clamp(1, MAX_COMPONENT_ID);

    (type_pref << 24) | (local_pref << 8) | (MAX_COMPONENT_ID - component)
}

/// Local preference for the interface at `index` in enumeration order
pub fn local_preference_for_index(index: usize) -> u32 {
    MAX_LOCAL_PREFERENCE.saturating_sub(index.min(MAX_LOCAL_PREFERENCE as usize) as u32)
}

/// Pair priority per RFC 8445 Section 6.1.2.3
///
/// `G` is the priority of the controlling agent's candidate, `D` that of the
/// controlled agent's candidate; both agents therefore order pairs the same way.
pub fn calculate_pair_priority(controlling_priority: u32, controlled_priority: u32) -> u64 {
    let g = controlling_priority as u64;
    let d = controlled_priority as u64;
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        assert_eq!(calculate_priority(CandidateType::Host, 65535, 1), 2130706431);
        assert_eq!(calculate_priority(CandidateType::ServerReflexive, 65535, 1), 1694498815);
        assert_eq!(calculate_priority(CandidateType::Relay, 65535, 2), 16777214);
    }

    #[test]
    fn test_orders_by_type_then_local_then_component() {
        let types = [
            CandidateType::Host,
            CandidateType::PeerReflexive,
            CandidateType::ServerReflexive,
            CandidateType::Relay,
        ];
        for pair in types.windows(2) {
            // Worst case of the better type still beats best case of the worse
            assert!(calculate_priority(pair[0], 0, 2) > calculate_priority(pair[1], 65535, 1));
        }
        assert!(calculate_priority(CandidateType::Host, 2, 2) > calculate_priority(CandidateType::Host, 1, 1));
        assert!(calculate_priority(CandidateType::Host, 7, 1) > calculate_priority(CandidateType::Host, 7, 2));
    }

    #[test]
    fn test_clamping() {
        assert_eq!(
            calculate_priority(CandidateType::Host, 1_000_000, 0),
            calculate_priority(CandidateType::Host, 65535, 1)
        );
    }

    #[test]
    fn test_local_preference_for_index() {
        assert_eq!(local_preference_for_index(0), 65535);
        assert_eq!(local_preference_for_index(3), 65532);
        assert_eq!(local_preference_for_index(usize::MAX), 0);
    }

    #[test]
    fn test_pair_priority_symmetric_between_agents() {
        let a = calculate_priority(CandidateType::Host, 65535, 1);
        let b = calculate_priority(CandidateType::ServerReflexive, 65535, 1);

        let p = calculate_pair_priority(a, b);
        assert_eq!(p, (1u64 << 32) * b as u64 + 2 * a as u64 + 1);
        assert_eq!(calculate_pair_priority(b, a), (1u64 << 32) * b as u64 + 2 * a as u64);
        assert_eq!(calculate_pair_priority(a, a), (1u64 << 32) * a as u64 + 2 * a as u64);
    }
}
