//! Key mixing and stream cipher of the Xiaomi BLE authentication
//!
//! The cipher is plain RC4; the key mixes combine the (reversed) MAC address
//! with the product id.

const STATE_SIZE: usize = 256;

pub fn mix_a(mac: &[u8; 6], product_id: u16) -> [u8; 8] {
    let low = product_id.to_le_bytes()[0];
    [mac[0], mac[2], mac[5], low, low, mac[4], mac[5], mac[1]]
}

pub fn mix_b(mac: &[u8; 6], product_id: u16) -> [u8; 8] {
    let [high, low] = product_id.to_be_bytes();
    [mac[0], mac[2], mac[5], high, mac[4], mac[0], mac[5], low]
}

/// RC4 keystream XOR. Applying it twice with the same key restores the input.
pub fn cipher(key: &[u8], input: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return input.to_vec();
    }

    let mut perm = [0u8; STATE_SIZE];
    for (i, slot) in perm.iter_mut().enumerate() {
        *slot = i as u8;
    }

    let mut j: u8 = 0;
    for i in 0..STATE_SIZE {
        j = j.wrapping_add(perm[i]).wrapping_add(key[i % key.len()]);
        perm.swap(i, j as usize);
    }

    let mut index1: u8 = 0;
    let mut index2: u8 = 0;
    input
        .iter()
        .map(|byte| {
            index1 = index1.wrapping_add(1);
            index2 = index2.wrapping_add(perm[index1 as usize]);
            perm.swap(index1 as usize, index2 as usize);
            let k = perm[perm[index1 as usize].wrapping_add(perm[index2 as usize]) as usize];
            byte ^ k
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REVERSED_MAC: [u8; 6] = [0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa];
    const PRODUCT_ID: u16 = 275;

    #[test]
    fn test_rc4_reference_vector() {
        assert_eq!(
            cipher(b"Key", b"Plaintext"),
            vec![0xbb, 0xf3, 0x16, 0xe8, 0xd9, 0x40, 0xaf, 0x0a, 0xd3]
        );
    }

    #[test]
    fn test_key_mixes() {
        assert_eq!(
            mix_a(&REVERSED_MAC, PRODUCT_ID),
            [0xff, 0xdd, 0xaa, 0x13, 0x13, 0xbb, 0xaa, 0xee]
        );
        assert_eq!(
            mix_b(&REVERSED_MAC, PRODUCT_ID),
            [0xff, 0xdd, 0xaa, 0x01, 0xbb, 0xff, 0xaa, 0x13]
        );
    }

    #[test]
    fn test_token_exchange() {
        let token: Vec<u8> = (1..=12).collect();
        let challenge = cipher(&mix_a(&REVERSED_MAC, PRODUCT_ID), &token);
        assert_eq!(
            challenge,
            vec![0x98, 0xa5, 0x61, 0x28, 0x0c, 0x67, 0x23, 0x53, 0xbb, 0x6e, 0xd9, 0x5f]
        );

        // The kettle answers with the token encrypted under both mixes
        let answer = cipher(
            &mix_a(&REVERSED_MAC, PRODUCT_ID),
            &cipher(&mix_b(&REVERSED_MAC, PRODUCT_ID), &token),
        );
        let recovered = cipher(
            &mix_b(&REVERSED_MAC, PRODUCT_ID),
            &cipher(&mix_a(&REVERSED_MAC, PRODUCT_ID), &answer),
        );
        assert_eq!(recovered, token);
    }
}
