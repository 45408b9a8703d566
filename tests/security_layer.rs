use digest_md5::*;

fn ha1() -> Ha1 {
    compute_ha1("chris", "elwood.innosoft.com", "secret", "OA6MG9tEQGm2hh", "OA6MHXh6VqTrRk", None)
}

fn protections() -> Vec<Protection> {
    let mut protections = vec![Protection::Integrity];
    protections.extend(CIPHERS.iter().map(Protection::Confidentiality));
    protections
}

/// A client and server layer. The client accepts 4096 byte payloads, the server 2048.
fn pair(protection: Protection) -> (SecurityLayer, SecurityLayer) {
    let ha1 = ha1();
    (SecurityLayer::new(Role::Client, protection, &ha1, 4096, 2048).unwrap(),
     SecurityLayer::new(Role::Server, protection, &ha1, 2048, 4096).unwrap())
}

#[test]
fn test_round_trip_sizes() {
    for protection in protections() {
        let (mut client, mut server) = pair(protection);
        assert_eq!(client.ssf(), protection.ssf());
        let block = protection.cipher().map_or(1, |cipher| cipher.block_len);
        let max = client.max_message_size();
        for &len in [0, 1, block - 1, block, block + 1, max].iter() {
            let message: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let frame = client.encode(&message).unwrap();
            assert!(frame.len() - 4 <= 2048, "{:?} {}", protection, len);
            assert_eq!(server.decode(&frame).unwrap(), vec![message.clone()], "{:?} {}", protection, len);

            let frame = server.encode(&message).unwrap();
            assert_eq!(client.decode(&frame).unwrap(), vec![message], "{:?} {}", protection, len);
        }
        assert_eq!(client.encode(&vec![0; max + 1]).unwrap_err(), Error::MessageTooLarge(max + 1));
    }
}

#[test]
fn test_chunked_decode() {
    for protection in protections() {
        let (mut client, mut server) = pair(protection);
        let mut stream = Vec::new();
        let messages: Vec<Vec<u8>> = (0..5).map(|i| vec![b'x'; i * 37]).collect();
        for message in &messages {
            stream.extend(client.encode(message).unwrap());
        }

        let mut decoded = Vec::new();
        let mut rest = &stream[..];
        let mut chunk = 1;
        while !rest.is_empty() {
            let take = chunk.min(rest.len());
            decoded.extend(server.decode(&rest[..take]).unwrap());
            rest = &rest[take..];
            chunk = chunk % 13 + 1;
        }
        assert_eq!(decoded, messages, "{:?}", protection);
    }
}

#[test]
fn test_out_of_sequence_frame() {
    for protection in protections() {
        let (mut client, mut server) = pair(protection);
        let first = client.encode(b"first").unwrap();
        let second = client.encode(b"second").unwrap();
        let third = client.encode(b"third").unwrap();
        assert_eq!(server.decode(&first).unwrap(), vec![b"first".to_vec()]);
        assert_eq!(server.decode(&third).unwrap_err(),
                   Error::Framing(Framing::Sequence {
                       expected: 1,
                       received: 2,
                   }),
                   "{:?}",
                   protection);
        assert_eq!(server.decode(&second).unwrap_err(), Error::Framing(Framing::Poisoned));
    }
}

#[test]
fn test_tampered_ciphertext() {
    for protection in protections() {
        let (mut client, mut server) = pair(protection);
        let mut frame = client.encode(b"attack at dawn").unwrap();
        frame[6] ^= 0x80;
        match server.decode(&frame).unwrap_err() {
            Error::Framing(Framing::Mac) | Error::Framing(Framing::Padding) => {}
            other => panic!("{:?}: unexpected error {:?}", protection, other),
        }
        let next = client.encode(b"retreat").unwrap();
        assert_eq!(server.decode(&next).unwrap_err(), Error::Framing(Framing::Poisoned));
    }
}

#[test]
fn test_different_session_keys() {
    let other = compute_ha1("chris", "elwood.innosoft.com", "secret", "OA6MG9tEQGm2hh", "other", None);
    for protection in protections() {
        let mut client = SecurityLayer::new(Role::Client, protection, &ha1(), 4096, 4096).unwrap();
        let mut server = SecurityLayer::new(Role::Server, protection, &other, 4096, 4096).unwrap();
        let frame = client.encode(b"hello").unwrap();
        assert!(server.decode(&frame).is_err(), "{:?}", protection);
    }
}

#[test]
fn test_same_role_cannot_talk() {
    for protection in protections() {
        let mut one = SecurityLayer::new(Role::Client, protection, &ha1(), 4096, 4096).unwrap();
        let mut two = SecurityLayer::new(Role::Client, protection, &ha1(), 4096, 4096).unwrap();
        let frame = one.encode(b"hello").unwrap();
        assert!(two.decode(&frame).is_err(), "{:?}", protection);
    }
}

#[test]
fn test_oversized_frame_rejected() {
    let ha1 = ha1();
    let mut client = SecurityLayer::new(Role::Client, Protection::Integrity, &ha1, 4096, 4096).unwrap();
    let mut server = SecurityLayer::new(Role::Server, Protection::Integrity, &ha1, 100, 4096).unwrap();
    let frame = client.encode(&[0; 200]).unwrap();
    assert_eq!(server.decode(&frame[..4]).unwrap_err(), Error::Framing(Framing::Length(216)));
}

#[test]
fn test_max_message_size() {
    let ha1 = ha1();
    let layer = |protection, maxbuf| {
        SecurityLayer::new(Role::Client, protection, &ha1, 4096, maxbuf).unwrap().max_message_size()
    };
    assert_eq!(layer(Protection::Integrity, 1000), 984);
    let rc4 = CipherSpec::by_name("rc4").unwrap();
    assert_eq!(layer(Protection::Confidentiality(rc4), 1000), 984);
    // floor((1000 - 6) / 8) * 8 = 992 ciphertext bytes, less the MAC and one padding byte.
    let des = CipherSpec::by_name("des").unwrap();
    assert_eq!(layer(Protection::Confidentiality(des), 1000), 981);
}
