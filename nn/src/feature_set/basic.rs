use crate::feature_set::FeatureSet;
use shakmaty::{Color, Role, Setup, Square};

const PIECE_FEATURES: u16 = 64 * 6 * 2; // 768

/// Offsets of the position state features, after the piece features
const WHITE_KING_SIDE: u16 = PIECE_FEATURES;
const WHITE_QUEEN_SIDE: u16 = PIECE_FEATURES + 1;
const BLACK_KING_SIDE: u16 = PIECE_FEATURES + 2;
const BLACK_QUEEN_SIDE: u16 = PIECE_FEATURES + 3;
const EN_PASSANT: u16 = PIECE_FEATURES + 4;
const WHITE_TO_MOVE: u16 = PIECE_FEATURES + 5;

/// The basic feature set
/// Tuple: <piece_square, piece_role, piece_color>, plus castling rights,
/// en passant availability and side to move
pub struct Basic;

impl Basic {
    pub fn new() -> Self {
        Basic
    }

    fn make_index(piece_square: Square, piece_role: Role, piece_color: Color) -> u16 {
        let channel = match piece_role {
            Role::Pawn => 0,
            Role::Knight => 1,
            Role::Bishop => 2,
            Role::Rook => 3,
            Role::Queen => 4,
            Role::King => 5,
        } + match piece_color {
            Color::White => 0,
            Color::Black => 6,
        };

        channel * 64 + piece_square as u16
    }
}

impl Default for Basic {
    fn default() -> Self {
        Basic::new()
    }
}

impl FeatureSet for Basic {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn num_features(&self) -> usize {
        PIECE_FEATURES as usize + 6 // 774
    }

    fn active_features(&self, setup: &Setup, features: &mut Vec<u16>) {
        for (square, piece) in setup.board.clone().into_iter() {
            features.push(Self::make_index(square, piece.role, piece.color));
        }

        // castling rights are stored as the squares of the rooks that can castle
        let rights = setup.castling_rights;
        for (square, feature) in [
            (Square::H1, WHITE_KING_SIDE),
            (Square::A1, WHITE_QUEEN_SIDE),
            (Square::H8, BLACK_KING_SIDE),
            (Square::A8, BLACK_QUEEN_SIDE),
        ] {
            if rights.contains(square) {
                features.push(feature);
            }
        }

        if setup.ep_square.is_some() {
            features.push(EN_PASSANT);
        }

        if setup.turn == Color::White {
            features.push(WHITE_TO_MOVE);
        }
    }
}
